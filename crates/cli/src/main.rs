use std::process::ExitCode;

fn main() -> ExitCode {
    touchpoint_cli::run()
}
