fn main() -> std::process::ExitCode {
    vaultshell_lib::run()
}
