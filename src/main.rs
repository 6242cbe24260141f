fn main() -> anyhow::Result<std::process::ExitCode> {
    sysgate_lib::run()
}
