//! CLI for zonegraph zones.
//!
//! Most subcommands are one RPC against a running zone. `replay` loads a graph
//! description into in-process zones and cross-checks both query strategies.

mod replay;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use zonegraph_client::{ClientConfig, GraphQueryClient, QueryStrategy, StaticResolver, ZoneClient};
use zonegraph_core::{EdgeId, EventStats, Permissions, VertexId, VertexType, ZoneId};
use zonegraph_index::InstrumentationConfig;

#[derive(Parser, Debug)]
#[command(name = "zonegraph", version, about = "Zone-partitioned permission graph client")]
struct Cli {
    /// Zone address as `zone=host:port`. Repeatable.
    #[arg(long = "zone", global = true, env = "ZONEGRAPH_ZONES", value_delimiter = ',')]
    zones: Vec<String>,

    /// Per-call timeout in milliseconds.
    #[arg(long, global = true, env = "ZONEGRAPH_TIMEOUT_MS", default_value_t = 5000)]
    timeout_ms: u64,

    /// Record notifications while replaying.
    #[arg(long, global = true, env = "ZONEGRAPH_INSTRUMENTATION", default_value_t = false)]
    instrumentation: bool,

    /// NDJSON notification report. Written to stdout when omitted.
    #[arg(long, global = true, env = "ZONEGRAPH_REPORT")]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// An edge and the zone the request goes to.
#[derive(Args, Debug)]
struct EdgeArgs {
    #[arg(value_name = "ZONE")]
    target: ZoneId,
    from: VertexId,
    to: VertexId,
}

impl EdgeArgs {
    fn edge(&self) -> EdgeId {
        EdgeId::new(self.from.clone(), self.to.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Checks that zones answer. Defaults to every configured zone.
    Healthcheck {
        #[arg(value_name = "ZONE")]
        only: Vec<ZoneId>,
    },

    /// Whether a zone finished building its index.
    IndexReady {
        #[arg(value_name = "ZONE")]
        target: ZoneId,
    },

    AddEdge {
        #[command(flatten)]
        edge: EdgeArgs,
        permissions: Permissions,
        /// Mark as a forwarded mutation; the zone will not propagate it.
        #[arg(long, default_value_t = false)]
        successive: bool,
    },

    RemoveEdge {
        #[command(flatten)]
        edge: EdgeArgs,
        #[arg(long, default_value_t = false)]
        successive: bool,
    },

    SetPermissions {
        #[command(flatten)]
        edge: EdgeArgs,
        permissions: Permissions,
        #[arg(long, default_value_t = false)]
        successive: bool,
    },

    /// Creates a vertex in the zone owning it.
    AddVertex {
        id: VertexId,
        #[arg(long = "type", default_value = "user")]
        kind: VertexType,
    },

    /// Lists children of a vertex, or parents with `--reversed`.
    Adjacent {
        #[arg(value_name = "ZONE")]
        target: ZoneId,
        vertex: VertexId,
        #[arg(long, default_value_t = false)]
        reversed: bool,
    },

    /// Permissions stored on one edge.
    Permissions {
        #[command(flatten)]
        edge: EdgeArgs,
    },

    /// Effective-permission queries.
    Query {
        #[arg(long, default_value = "indexed")]
        strategy: QueryStrategy,
        #[command(subcommand)]
        query: QueryCommand,
    },

    /// Asks both strategies and fails if they disagree.
    Compare {
        #[command(flatten)]
        edge: EdgeArgs,
    },

    /// Event counters per zone and summed.
    Stats {
        #[arg(value_name = "ZONE")]
        only: Vec<ZoneId>,
    },

    DependentZones {
        #[arg(value_name = "ZONE")]
        target: ZoneId,
        /// Zones to leave out of the answer.
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<ZoneId>,
        /// Follow dependencies transitively.
        #[arg(long, default_value_t = false)]
        transitive: bool,
    },

    /// Loads a graph description into in-process zones and cross-checks it.
    Replay {
        #[arg(long)]
        graph: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum QueryCommand {
    Reaches {
        #[command(flatten)]
        edge: EdgeArgs,
    },
    Members {
        #[arg(value_name = "ZONE")]
        target: ZoneId,
        vertex: VertexId,
    },
    Effective {
        #[command(flatten)]
        edge: EdgeArgs,
    },
}

impl Cli {
    fn resolver(&self) -> Result<StaticResolver, Box<dyn std::error::Error>> {
        Ok(StaticResolver::parse(&self.zones)?)
    }

    fn client(&self) -> Result<ZoneClient, Box<dyn std::error::Error>> {
        let config = ClientConfig::default().with_timeout(Duration::from_millis(self.timeout_ms));
        Ok(ZoneClient::new(self.resolver()?, &config)?)
    }

    /// `requested`, or every configured zone when empty.
    fn zones_or_all(&self, requested: &[ZoneId]) -> Result<Vec<ZoneId>, Box<dyn std::error::Error>> {
        if !requested.is_empty() {
            return Ok(requested.to_vec());
        }
        let mut all: Vec<ZoneId> = self.resolver()?.zones().cloned().collect();
        all.sort();
        Ok(all)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Healthcheck { only } => {
            let client = cli.client()?;
            let zones = cli.zones_or_all(only)?;
            let mut healthy = true;
            for (zone, ok) in client.healthcheck_all(zones).await {
                println!("{zone}\t{}", if ok { "ok" } else { "down" });
                healthy &= ok;
            }
            if !healthy {
                return Err("some zones are down".into());
            }
        }
        Commands::IndexReady { target } => {
            println!("{}", cli.client()?.index_ready(target).await?);
        }
        Commands::AddEdge {
            edge,
            permissions,
            successive,
        } => {
            cli.client()?
                .add_edge(&edge.target, &edge.edge(), *permissions, *successive)
                .await?;
            tracing::info!(zone = %edge.target, edge = %edge.edge(), %permissions, "edge added");
        }
        Commands::RemoveEdge { edge, successive } => {
            cli.client()?
                .remove_edge(&edge.target, &edge.edge(), *successive)
                .await?;
            tracing::info!(zone = %edge.target, edge = %edge.edge(), "edge removed");
        }
        Commands::SetPermissions {
            edge,
            permissions,
            successive,
        } => {
            cli.client()?
                .set_permissions(&edge.target, &edge.edge(), *permissions, *successive)
                .await?;
            tracing::info!(zone = %edge.target, edge = %edge.edge(), %permissions, "permissions set");
        }
        Commands::AddVertex { id, kind } => {
            cli.client()?.add_vertex(id, *kind).await?;
            tracing::info!(vertex = %id, %kind, "vertex added");
        }
        Commands::Adjacent {
            target,
            vertex,
            reversed,
        } => {
            let client = cli.client()?;
            let adjacent = if *reversed {
                client.list_adjacent_reversed(target, vertex).await?
            } else {
                client.list_adjacent(target, vertex).await?
            };
            for v in adjacent {
                println!("{v}");
            }
        }
        Commands::Permissions { edge } => {
            let permissions = cli.client()?.permissions(&edge.target, &edge.edge()).await?;
            println!("{permissions}");
        }
        Commands::Query { strategy, query } => {
            let client = cli.client()?.query(*strategy);
            match query {
                QueryCommand::Reaches { edge } => {
                    println!("{}", client.reaches(&edge.target, &edge.edge()).await?);
                }
                QueryCommand::Members { target, vertex } => {
                    for v in client.members(target, vertex).await? {
                        println!("{v}");
                    }
                }
                QueryCommand::Effective { edge } => {
                    let p = client.effective_permissions(&edge.target, &edge.edge()).await?;
                    println!("{p}");
                }
            }
        }
        Commands::Compare { edge } => {
            let client = cli.client()?;
            let id = edge.edge();
            let mut agree = true;
            let mut answers = Vec::new();
            for strategy in QueryStrategy::ALL {
                let q = client.query(strategy);
                answers.push((
                    strategy,
                    q.reaches(&edge.target, &id).await?,
                    q.effective_permissions(&edge.target, &id).await?,
                    q.members(&edge.target, &id.to).await?,
                ));
            }
            for (strategy, reaches, permissions, members) in &answers {
                println!("{strategy}\treaches={reaches}\teffective={permissions}\tmembers={}", members.len());
                agree &= (reaches, permissions, members) == (&answers[0].1, &answers[0].2, &answers[0].3);
            }
            if !agree {
                return Err(format!("strategies disagree on {id}").into());
            }
        }
        Commands::Stats { only } => {
            let client = cli.client()?;
            let mut total = EventStats::default();
            for zone in cli.zones_or_all(only)? {
                let stats = client.get_event_stats(&zone).await?;
                println!("{zone}\t{}", serde_json::to_string(&stats)?);
                total.merge(&stats);
            }
            println!("total\t{}", serde_json::to_string(&total)?);
        }
        Commands::DependentZones {
            target,
            exclude,
            transitive,
        } => {
            let client = cli.client()?;
            let dependents = if *transitive {
                client.resolve_dependent_zones(target).await?
            } else {
                client.get_dependent_zones(target, exclude).await?
            };
            println!("{}", serde_json::to_string_pretty(&dependents)?);
        }
        Commands::Replay { graph } => {
            let config = InstrumentationConfig {
                enabled: cli.instrumentation,
                report_path: cli.report.clone(),
            };
            let to_stdout = config.enabled && config.report_path.is_none();
            let report = replay::run(graph, &config).await?;

            // NDJSON owns stdout when no report file is given.
            if to_stdout {
                eprint!("{}", report.render());
            } else {
                print!("{}", report.render());
            }
            if !report.mismatches.is_empty() {
                return Err(format!("{} mismatches between strategies", report.mismatches.len()).into());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_edge_commands() {
        let cli = Cli::try_parse_from([
            "zonegraph",
            "--zone",
            "eu=127.0.0.1:8001,us=127.0.0.1:8002",
            "add-edge",
            "eu",
            "eu:u1",
            "us:g1",
            "101",
            "--successive",
        ])
        .unwrap();

        assert_eq!(cli.zones.len(), 2);
        match cli.command {
            Commands::AddEdge {
                edge,
                permissions,
                successive,
            } => {
                assert_eq!(edge.target, ZoneId::new("eu"));
                assert_eq!(edge.edge().to.owner(), &ZoneId::new("us"));
                assert_eq!(permissions, "101".parse().unwrap());
                assert!(successive);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn query_defaults_to_indexed() {
        let cli = Cli::try_parse_from(["zonegraph", "query", "members", "eu", "eu:g1"]).unwrap();
        match cli.command {
            Commands::Query { strategy, .. } => assert_eq!(strategy, QueryStrategy::Indexed),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_vertices_and_permissions() {
        assert!(Cli::try_parse_from(["zonegraph", "permissions", "eu", "nozone", "eu:g1"]).is_err());
        assert!(
            Cli::try_parse_from(["zonegraph", "add-edge", "eu", "eu:u1", "eu:g1", "12"]).is_err()
        );
    }

    #[test]
    fn healthcheck_defaults_to_configured_zones() {
        let cli = Cli::try_parse_from([
            "zonegraph",
            "--zone",
            "us=127.0.0.1:8002",
            "--zone",
            "eu=127.0.0.1:8001",
            "healthcheck",
        ])
        .unwrap();
        assert_eq!(
            cli.zones_or_all(&[]).unwrap(),
            vec![ZoneId::new("eu"), ZoneId::new("us")]
        );
    }
}
