//! Tracer application entry point: `ct <pid>`.

use clap::Parser;
use crashtracer::module::api;
use crashtracer::tracer::Tracer;
use nix::unistd::Pid;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pid of the faulted worker process (0 inspects the tracer itself)
    pid: i32,

    /// Diagnostic log filter, e.g. "debug" or "tracer=debug"
    #[arg(long, env = "CT_LOG", default_value = "info")]
    log: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    env_logger::Builder::new()
        .parse_filters(&args.log)
        .init();

    let tracer = match Tracer::attach(Pid::from_raw(args.pid)) {
        Ok(tracer) => tracer,
        Err(e) => {
            eprintln!("ct: attach failed: {e:#} [{:?}]", api::err_code(&e));
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = std::io::stdout().lock();
    match tracer.trace(&mut stdout) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ct: trace failed: {e:#} [{:?}]", api::err_code(&e));
            ExitCode::FAILURE
        }
    }
}
