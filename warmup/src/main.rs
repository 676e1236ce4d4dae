use core::error::Error;

use clap::Parser;
use warmup::{cfg::Config, cmd::Cmd, orchestrator::Outcome, Trigger};

pub fn main() {
    let cmd = Cmd::parse();
    warmup::logging::init(cmd.verbose).unwrap();

    if let Err(err) = run(cmd) {
        eprintln!("ERROR: {err}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> Result<(), Box<dyn Error>> {
    let cfg: Config = cmd.try_into()?;

    let completion = match warmup::trigger(&cfg)? {
        Trigger::Started(completion) => completion,
        Trigger::Disabled => return Ok(()),
    };

    // Standalone there is nothing else to do, so wait for the warmup to end.
    match completion.wait() {
        Outcome::TimedOut => log::warn!("service at {} never came up", cfg.base_url()),
        Outcome::Finished { failed: 0 } => log::info!("warmed up {}", cfg.base_url()),
        Outcome::Finished { failed } => log::warn!("warmed up {}, {failed} workers failed", cfg.base_url()),
        Outcome::Aborted => return Err("warmup aborted".into()),
    }

    Ok(())
}
