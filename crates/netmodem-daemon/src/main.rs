//! NetModem daemon
//!
//! Runs the modem engine against a host serial port and the host's TCP/IP
//! stack until Ctrl-C.

mod host;
mod options;
mod store;

use anyhow::{anyhow, Context, Result};
use std::rc::Rc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use netmodem_core::modem::{Collaborators, Session};
use netmodem_core::ports::memory::{MemoryPrinter, MemoryTimeService};
use netmodem_core::ports::serial_port::SerialPortLine;
use netmodem_core::ports::tcp::TcpNetwork;
use netmodem_core::ports::SystemClock;

use host::HostPlatform;
use options::DaemonOptions;
use store::{FileConfigStore, FileFetcher, FilePhoneBook};

fn open_line(options: &DaemonOptions) -> Result<SerialPortLine> {
    SerialPortLine::open(&options.port, Some(options.baud)).map_err(|e| {
        let known: Vec<String> = serialport::available_ports()
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.port_name)
            .collect();
        if !known.is_empty() {
            warn!("available ports: {}", known.join(", "));
        }
        anyhow!("cannot open {}: {}", options.port, e)
    })
}

fn collaborators(options: &DaemonOptions) -> Collaborators {
    Collaborators {
        network: Box::new(TcpNetwork::new()),
        platform: Box::new(HostPlatform::new()),
        time: Box::new(MemoryTimeService::default()),
        printer: Box::new(MemoryPrinter::new()),
        fetcher: Box::new(FileFetcher),
        store: Box::new(FileConfigStore::new(&options.data_dir)),
        phonebook: Box::new(FilePhoneBook::open(&options.data_dir)),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = DaemonOptions::from_environment().context("loading options")?;
    info!(
        "NetModem {} on {} at {} baud, data in {}",
        netmodem_core::VERSION,
        options.port,
        options.baud,
        options.data_dir.display()
    );

    let line = open_line(&options)?;
    let mut session = Session::new(Box::new(line), Rc::new(SystemClock::default()), collaborators(&options));
    session.set_help_url(&options.help_url);
    session.boot();

    let mut ticker = tokio::time::interval(Duration::from_millis(options.tick_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => session.step(),
            signal = &mut shutdown => {
                signal.context("waiting for Ctrl-C")?;
                info!("shutting down");
                break;
            }
        }
    }
    Ok(())
}
