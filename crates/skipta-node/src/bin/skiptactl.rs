use std::collections::BTreeMap;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use skipta_ctrl::{ConfigSource, CtrlClerk};
use skipta_types::{GroupId, SHARD_COUNT};

#[derive(Parser, Debug)]
#[command(name = "skiptactl", about = "Skipta shard controller admin client")]
struct Cli {
    /// Shard controller endpoints, repeatable.
    #[arg(long = "ctrl", required = true)]
    ctrl: Vec<String>,
    #[command(subcommand)]
    command: CtlCommand,
}

#[derive(Subcommand, Debug)]
enum CtlCommand {
    /// Print a configuration (latest if no number is given).
    Query {
        #[arg(long)]
        num: Option<i64>,
    },
    /// Add replica groups: "gid=addr1,addr2" specs, repeatable.
    Join {
        #[arg(long = "group", required = true)]
        groups: Vec<String>,
    },
    /// Remove replica groups by id.
    Leave {
        #[arg(long = "gid", required = true)]
        gids: Vec<GroupId>,
    },
    /// Pin one shard to a group.
    Move {
        #[arg(long)]
        shard: usize,
        #[arg(long)]
        gid: GroupId,
    },
}

fn parse_group(spec: &str) -> anyhow::Result<(GroupId, Vec<String>)> {
    let (gid, servers) = spec
        .split_once('=')
        .with_context(|| format!("group spec {spec:?} is not gid=addr,addr"))?;
    let gid: GroupId = gid.parse().with_context(|| format!("bad group id in {spec:?}"))?;
    if gid == 0 {
        bail!("group id 0 is reserved for unassigned shards");
    }
    let servers: Vec<String> = servers.split(',').map(str::to_string).collect();
    if servers.iter().any(String::is_empty) {
        bail!("group spec {spec:?} has an empty server address");
    }
    Ok((gid, servers))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let clerk = CtrlClerk::connect(&cli.ctrl).context("failed to set up controller clerk")?;

    match cli.command {
        CtlCommand::Query { num } => {
            let config = clerk.query(num.unwrap_or(-1)).await?;
            println!("config {}", config.num);
            for shard in 0..SHARD_COUNT {
                println!("  shard {shard} -> group {}", config.shards[shard]);
            }
            for (gid, servers) in &config.groups {
                println!("  group {gid}: {}", servers.join(", "));
            }
        }
        CtlCommand::Join { groups } => {
            let groups: BTreeMap<GroupId, Vec<String>> = groups
                .iter()
                .map(|spec| parse_group(spec))
                .collect::<anyhow::Result<_>>()?;
            clerk.join(groups).await?;
            println!("join accepted");
        }
        CtlCommand::Leave { gids } => {
            clerk.leave(gids).await?;
            println!("leave accepted");
        }
        CtlCommand::Move { shard, gid } => {
            if shard >= SHARD_COUNT {
                bail!("shard {shard} out of range (0..{SHARD_COUNT})");
            }
            clerk.move_shard(shard, gid).await?;
            println!("moved shard {shard} to group {gid}");
        }
    }
    Ok(())
}
