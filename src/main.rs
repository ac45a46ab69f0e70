use std::process::ExitCode;

fn main() -> ExitCode {
    medscan::run_cli()
}
