//! rdbtrace: offline analyzer for TCP packet captures, reporting latency, retransmission,
//! redundant data bundling (RDB), loss, throughput and queueing behavior per connection.

use anyhow::Context;
use clap::Parser;

mod cli;
mod decode;
mod dump;
mod output;

use crate::cli::CliArgs;
use crate::dump::Dump;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    if let Err(e) = run() {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap formats both errors and --help/--version output itself
            e.print().expect("writing clap output");
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    if args.with_loss && args.receiver_dump.is_none() {
        anyhow::bail!("loss analysis requires a receiver-side dump (-g)");
    }

    let cfg = args.to_config();
    let mut dump = Dump::new(&args, cfg);

    dump.analyse_sender(&args.sender_dump)?;
    if let Some(path) = &args.sojourn_dump {
        dump.process_sojourn(path)?;
    }
    if let Some(path) = &args.receiver_dump {
        dump.process_recvd(path)?;
    }
    dump.finish();

    output::print_statistics(&mut dump, &args);

    if let Some((dir, name)) = args.file_output() {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        output::write_statistics_files(&dump, &dir, &name)
            .context("writing statistics files")?;
    }
    Ok(())
}
