//! Command-line driver for one middleware role per process.
//!
//! Run a small deployment on one host, e.g.:
//!
//! ```text
//! busdemo discovery --config config.json --name disc1 --port 5555
//! busdemo publisher --config config.json --name pub-a --port 5577 \
//!     --discovery 127.0.0.1:5555 --topics t1,t2
//! busdemo subscriber --config config.json --name sub-1 \
//!     --discovery 127.0.0.1:5555 --topics t1 --sink latency.jsonl
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::error;

use topicbus::broker::{BrokerEngine, BrokerOptions};
use topicbus::config::{Config, DhtRoster};
use topicbus::discovery::{DiscoveryEngine, DiscoveryOptions};
use topicbus::latency::{JsonlSink, LatencySink, NullSink};
use topicbus::publisher::{CounterValues, PublisherEngine, PublisherOptions};
use topicbus::reactor::EventLoop;
use topicbus::subscriber::{SubscriberEngine, SubscriberOptions};

#[derive(Parser)]
#[command(name = "busdemo", about = "topicbus demo processes")]
struct Cli {
  /// Deployment configuration file.
  #[arg(short, long, default_value = "config.json")]
  config: String,

  /// DHT ring roster (DHT discovery only).
  #[arg(short = 'j', long, default_value = "dht.json")]
  roster: String,

  #[command(subcommand)]
  role: RoleCmd,
}

#[derive(Subcommand)]
enum RoleCmd {
  Discovery {
    #[arg(short, long)]
    name: String,
    #[arg(short, long, default_value_t = 5555)]
    port: u16,
    #[arg(short = 's', long, default_value_t = 5556)]
    sub_port: u16,
    #[arg(short, long, default_value = "127.0.0.1")]
    addr: String,
  },
  Publisher {
    #[arg(short, long)]
    name: String,
    #[arg(short, long, default_value_t = 5577)]
    port: u16,
    #[arg(short, long, default_value = "127.0.0.1")]
    addr: String,
    #[arg(short, long)]
    discovery: Option<String>,
    /// Comma-separated topics to publish.
    #[arg(short, long)]
    topics: String,
    #[arg(short, long, default_value_t = 20)]
    iters: u32,
    #[arg(short, long, default_value_t = 1.0)]
    frequency: f64,
    #[arg(short, long, default_value = "exp")]
    experiment: String,
  },
  Subscriber {
    #[arg(short, long)]
    name: String,
    #[arg(short, long)]
    discovery: Option<String>,
    /// Comma-separated topics of interest.
    #[arg(short, long)]
    topics: String,
    /// Where to flush latency samples; omitted means discard.
    #[arg(long)]
    sink: Option<String>,
  },
  Broker {
    #[arg(short, long)]
    name: String,
    #[arg(short, long, default_value_t = 6000)]
    port: u16,
    #[arg(short, long, default_value = "127.0.0.1")]
    addr: String,
    #[arg(short, long)]
    discovery: Option<String>,
    #[arg(short, long)]
    group: Option<String>,
  },
}

fn main() -> ExitCode {
  env_logger::init();
  match run() {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!("fatal: {e}");
      ExitCode::FAILURE
    }
  }
}

fn run() -> topicbus::Result<()> {
  let cli = Cli::parse();
  let cfg = Config::from_file(&cli.config)?;
  let roster = || -> topicbus::Result<Option<DhtRoster>> {
    if cfg.discovery == topicbus::config::LookupStrategy::Dht {
      Ok(Some(DhtRoster::from_file(&cli.roster)?))
    } else {
      Ok(None)
    }
  };
  let idle = Duration::from_millis(cfg.idle_timeout_ms);
  let mut lp = EventLoop::new()?;

  match cli.role {
    RoleCmd::Discovery {
      name,
      port,
      sub_port,
      addr,
    } => {
      let mut opts = DiscoveryOptions::named(&name);
      opts.addr = addr.clone();
      opts.bind_addr = "0.0.0.0".to_string();
      opts.port = port;
      opts.sub_port = sub_port;
      opts.roster = roster()?;
      let mut engine = DiscoveryEngine::new(cfg, opts, lp.registry()?, None)?;
      let first = engine.start_timeout();
      lp.run(&mut engine, first)
    }
    RoleCmd::Publisher {
      name,
      port,
      addr,
      discovery,
      topics,
      iters,
      frequency,
      experiment,
    } => {
      let topics: Vec<&str> = topics.split(',').collect();
      let mut opts = PublisherOptions::named(&name, &topics);
      opts.addr = addr;
      opts.bind_addr = "0.0.0.0".to_string();
      opts.port = port;
      opts.iters = iters;
      opts.frequency = frequency;
      opts.experiment = experiment;
      opts.discovery_endpoint = discovery;
      opts.roster = roster()?;
      let mut engine = PublisherEngine::new(
        cfg,
        opts,
        lp.registry()?,
        None,
        Box::new(CounterValues::default()),
        Box::new(NullSink),
      )?;
      let first = engine.start_timeout();
      lp.run(&mut engine, first)
    }
    RoleCmd::Subscriber {
      name,
      discovery,
      topics,
      sink,
    } => {
      let topics: Vec<&str> = topics.split(',').collect();
      let mut opts = SubscriberOptions::named(&name, &topics);
      opts.idle_timeout = idle;
      opts.discovery_endpoint = discovery;
      opts.roster = roster()?;
      let sink: Box<dyn LatencySink> = match sink {
        Some(path) => Box::new(JsonlSink::new(path)),
        None => Box::new(NullSink),
      };
      let mut engine = SubscriberEngine::new(cfg, opts, lp.registry()?, None, sink)?;
      let first = engine.start_timeout();
      lp.run(&mut engine, first)
    }
    RoleCmd::Broker {
      name,
      port,
      addr,
      discovery,
      group,
    } => {
      let mut opts = BrokerOptions::named(&name);
      opts.addr = addr;
      opts.bind_addr = "0.0.0.0".to_string();
      opts.port = port;
      opts.group = group;
      opts.idle_timeout = idle;
      opts.discovery_endpoint = discovery;
      opts.roster = roster()?;
      let mut engine = BrokerEngine::new(cfg, opts, lp.registry()?, None)?;
      let first = engine.start_timeout();
      lp.run(&mut engine, first)
    }
  }
}
