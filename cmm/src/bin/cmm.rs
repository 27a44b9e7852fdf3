//! Runs a cluster member, or inspects a running one.

use clap::{Parser, Subcommand, ValueEnum};
use cmm::admin;
use cmm::frame::{InfoRequest, Message};
use cmm::membership::InfoReply;
use cmm::ring::read_frame;
use cmm::{Cluster, ClusterConfig, NodeId};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cmm")]
#[command(about = "Cluster membership monitor")]
struct Args {
  #[command(subcommand)]
  command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
  /// Join the cluster and run until interrupted, then leave gracefully.
  Run {
    /// JSON cluster configuration.
    #[arg(short, long)]
    config: PathBuf,
    /// Overrides the configured local node id.
    #[arg(short, long)]
    local: Option<u16>,
  },
  /// Ask a node's admin server for a membership snapshot.
  Info {
    #[arg(short, long)]
    admin: SocketAddr,
    #[arg(short, long, value_enum, default_value = "all")]
    request: RequestArg,
    /// Node id for `--request given`.
    #[arg(short, long)]
    given: Option<u16>,
    /// Use the fixed-width record layout.
    #[arg(long)]
    legacy: bool,
  },
  /// Print a node's notification stream.
  Watch {
    #[arg(short, long)]
    notify: SocketAddr,
  },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RequestArg {
  Me,
  Master,
  Vice,
  Given,
  All,
  Count,
}
impl From<RequestArg> for InfoRequest {
  fn from(r: RequestArg) -> InfoRequest {
    match r {
      RequestArg::Me => InfoRequest::Me,
      RequestArg::Master => InfoRequest::Master,
      RequestArg::Vice => InfoRequest::ViceMaster,
      RequestArg::Given => InfoRequest::GivenNode,
      RequestArg::All => InfoRequest::All,
      RequestArg::Count => InfoRequest::AllCountOnly,
    }
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  match Args::parse().command {
    Cmd::Run { config, local } => {
      let mut config = ClusterConfig::from_json_file(&config)?;
      if let Some(local) = local {
        config.local = NodeId(local);
      }
      let node = Cluster::start(config).await?;
      tokio::signal::ctrl_c().await?;
      info!(node = %node.local_id(), "interrupted, leaving");
      node.leave().await?;
    }
    Cmd::Info {
      admin: addr,
      request,
      given,
      legacy,
    } => {
      let reply = admin::query(
        addr,
        request.into(),
        given.map(NodeId),
        legacy,
        Duration::from_secs(5),
      )
      .await?;
      match reply {
        InfoReply::Node(info) => {
          println!("{} node(s)", info.count);
          for r in info.records {
            println!(
              "{:>5} {:<16} alive={} eligible={} master={} vice={} off={} disks={}",
              r.id, r.name, r.alive, r.eligible, r.master, r.vice_master, r.off, r.active_disks
            );
          }
        }
        InfoReply::CNode(info) => {
          println!("{} node(s)", info.count);
          for r in info.records {
            println!(
              "{:>5} {:<16} {:<21} sflags={:#x} incarnation={} swload={}",
              r.id, r.name, r.addr, r.sflags.0, r.incarnation, r.swload
            );
          }
        }
      }
    }
    Cmd::Watch { notify } => {
      let mut stream = TcpStream::connect(notify).await?;
      loop {
        let frame = match read_frame(&mut stream).await {
          Ok(frame) => frame,
          Err(e) => {
            error!(error = %e, "notification stream ended");
            break;
          }
        };
        match frame.message {
          Message::NodeInfo(info) => {
            for r in info.records {
              println!("member {} alive={} master={} vice={}", r.id, r.alive, r.master, r.vice_master);
            }
          }
          Message::NodeChange(c) => match c.node {
            Some(node) => println!("{:?} {}", c.cause, node),
            None => println!("{:?}", c.cause),
          },
          Message::ConfigChangeNotif(c) => println!("{:?} {} {:?}", c.cause, c.node, c.file),
          other => println!("{:?}", other),
        }
      }
    }
  }
  Ok(())
}
