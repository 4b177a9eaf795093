use std::{fs, process};

use clap::Parser;
use log::{debug, error};

use wsrelay::client::ProbeClient;
use wsrelay::hello::HelloServer;
use wsrelay::option::BootOption;
use wsrelay::server::RelayServer;
use wsrelay::utils::init_logger;

/// wsrelay tunnels byte streams through WebSocket channels
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// config file of wsrelay start
    #[arg(short, long)]
    pub config: String,
}

fn main() {
    let args = Args::parse();
    let fscontent = match fs::read_to_string(&args.config) {
        Ok(ret) => ret,
        Err(e) => {
            eprintln!("read config file {} failed: {}", args.config, e);
            process::exit(2);
        }
    };
    let opts: BootOption = match serde_json::from_str(&fscontent) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("invalid config file {}: {}", args.config, e);
            process::exit(2);
        }
    };

    init_logger(opts.log_level());
    if let Ok(jsonstr) = serde_json::to_string_pretty(&opts) {
        debug!("options:\n{}", jsonstr);
    }

    let ret = match opts {
        BootOption::Relay(opts) => RelayServer::new(opts).bootstrap(),
        BootOption::Client(opts) => ProbeClient::new(opts).bootstrap(),
        BootOption::Hello(opts) => HelloServer::from_opts(&opts).and_then(|server| server.serve()),
    };
    if let Err(e) = ret {
        error!("{}", e);
        process::exit(1);
    }
}
