use std::process::ExitCode;

fn main() -> ExitCode {
    dealgate_cli::run()
}
