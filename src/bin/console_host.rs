//! Halts the target, then streams its semihosting console to stdout until
//! it calls `SYS_EXIT`.

use clap::Parser;

use swd_dude::error::print_error_chain;
use swd_dude::transport::FtdiTransport;
use swd_dude::Session;

/// Bring a Cortex-M target up over SWD and stream its semihosting console.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Named entry in the built-in programmer table (overrides --vid/--pid/--interface).
    #[arg(long)]
    programmer: Option<String>,

    /// USB vendor ID of the bridge chip.
    #[arg(long)]
    vid: Option<u16>,

    /// USB product ID of the bridge chip.
    #[arg(long)]
    pid: Option<u16>,

    /// Bridge interface index (0-3).
    #[arg(long, default_value_t = 0)]
    interface: u8,
}

fn resolve_connection(cli: &Cli) -> swd_dude::error::Result<(u16, u16, u8, u32)> {
    if let Some(name) = &cli.programmer {
        let p = swd_dude::programmer::lookup(name)
            .ok_or_else(|| swd_dude::error::Error::UnknownProgrammer(name.clone()))?;
        return Ok((p.vid, p.pid, cli.interface, p.default_frequency_hz));
    }
    let vid = cli.vid.unwrap_or(0x0403);
    let pid = cli.pid.unwrap_or(0x6014);
    Ok((vid, pid, cli.interface, 4_000_000))
}

fn main() {
    let cli = Cli::parse();
    swd_dude::logging::init(swd_dude::logging::level_filter_for(cli.verbose));

    match run(&cli) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            print_error_chain(&err);
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> swd_dude::error::Result<()> {
    let (vid, pid, interface, frequency_hz) = resolve_connection(cli)?;
    let transport = FtdiTransport::open(vid, pid, interface)
        .map_err(|e| swd_dude::error::Error::Transport(e.into()))?;

    let mut session = Session::connect(transport, frequency_hz)?;
    session.halt()?;

    let stdout = std::io::stdout();
    let mut console = stdout.lock();
    let exit_code = session.run_semihosting(&mut console)?;
    log::info!("target exited with code {exit_code}");

    let transport = session.teardown();
    drop(transport);
    Ok(())
}
