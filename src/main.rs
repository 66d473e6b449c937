use std::process::ExitCode;

fn main() -> ExitCode {
    subrelay_lib::run()
}
