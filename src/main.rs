use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use fleetq::config::Config;
use fleetq::fleet::types::{AssignedVessel, Issue, IssuePatch, IssuePriority, IssueStatus, NewIssue, Vessel, VesselStatus};
use fleetq::fleet::{
  FleetCache, FleetCollection, FleetQuery, IssueFilter, MutationOutcome, MutationSpec, PageParams, Record,
  VesselFilter,
};
use fleetq::logging;
use fleetq::query::QueryView;
use fleetq::session::StaticSession;

#[derive(Parser, Debug)]
#[command(name = "fleetq")]
#[command(about = "Query and update the fleet maintenance API through a consistent cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fleetq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL, overrides api.url
  #[arg(long)]
  api_url: Option<String>,

  /// User id of the session, overrides session.user_id
  #[arg(long)]
  user: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(clap::Args, Debug)]
struct Paging {
  #[arg(long, default_value_t = 1)]
  page: u32,
  #[arg(long)]
  limit: Option<u32>,
}

impl Paging {
  fn params(&self) -> PageParams {
    PageParams::new(self.page, self.limit)
  }
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List vessels
  #[command(visible_alias = "v")]
  Vessels {
    #[arg(long)]
    status: Option<VesselStatus>,
    #[arg(long = "type")]
    vessel_type: Option<String>,
    #[arg(long)]
    flag: Option<String>,
    #[arg(short, long)]
    search: Option<String>,
    #[command(flatten)]
    paging: Paging,
  },

  /// List issues, or only your own with --mine
  #[command(visible_alias = "i")]
  Issues {
    #[arg(long)]
    mine: bool,
    #[arg(long)]
    vessel: Option<String>,
    #[arg(long)]
    status: Option<IssueStatus>,
    #[arg(long)]
    priority: Option<IssuePriority>,
    #[arg(long)]
    category: Option<String>,
    #[arg(short, long)]
    search: Option<String>,
    #[command(flatten)]
    paging: Paging,
  },

  /// Run any cached query, e.g. `fleetq query issues status=open page=2`
  Query {
    collection: FleetCollection,
    /// Parameters as key=value
    params: Vec<String>,
  },

  /// Report a new issue on a vessel
  Report {
    #[arg(long)]
    vessel: String,
    #[arg(long)]
    category: String,
    #[arg(long)]
    description: String,
    #[arg(long)]
    priority: Option<IssuePriority>,
  },

  /// Change an issue
  UpdateIssue {
    id: String,
    #[arg(long)]
    status: Option<IssueStatus>,
    #[arg(long)]
    priority: Option<IssuePriority>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    description: Option<String>,
  },

  DeleteIssue {
    id: String,
  },

  /// Recompute vessel statuses from their open issues
  Scan,

  /// Vessels you have issues on
  Assigned,

  /// Issues commonly reported for a category on a vessel type
  Recommend {
    #[arg(long)]
    category: String,
    #[arg(long = "type")]
    vessel_type: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, command line wins
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(url) = args.api_url {
    config.api.url = url;
  }
  if let Some(user) = args.user {
    config.session.user_id = Some(user);
  }

  let _guard = logging::init(&config.logging)?;

  let token = Config::get_api_token()
    .map_err(|e| warn!(error = %e, "Continuing without credentials"))
    .ok();
  let session = Arc::new(StaticSession::new(config.session.session(), token));
  let cache = FleetCache::new(&config, session)?;
  cache.init();

  match args.command {
    Command::Vessels {
      status,
      vessel_type,
      flag,
      search,
      paging,
    } => {
      let filter = VesselFilter {
        status,
        vessel_type,
        flag,
        search,
      };
      let view = settled(&cache, FleetQuery::vessels(filter, paging.params())).await?;
      print_records(&view);
    }
    Command::Issues {
      mine,
      vessel,
      status,
      priority,
      category,
      search,
      paging,
    } => {
      let filter = IssueFilter {
        vessel_id: vessel,
        status,
        priority,
        category,
        search,
      };
      let query = if mine {
        FleetQuery::my_issues(filter, paging.params())
      } else {
        FleetQuery::issues(filter, paging.params())
      };
      let view = settled(&cache, query).await?;
      print_records(&view);
    }
    Command::Query { collection, params } => {
      let pairs = params
        .iter()
        .map(|p| p.split_once('=').ok_or_else(|| eyre!("Expected key=value, got {:?}", p)))
        .collect::<Result<Vec<_>>>()?;
      let query = FleetQuery::from_pairs(collection, pairs)?;
      let view = settled(&cache, query).await?;
      print_records(&view);
    }
    Command::Report {
      vessel,
      category,
      description,
      priority,
    } => {
      let spec = MutationSpec::CreateIssue(NewIssue {
        vessel_id: vessel,
        category,
        description,
        priority,
        status: None,
      });
      print_outcome(cache.mutate(spec).await?);
    }
    Command::UpdateIssue {
      id,
      status,
      priority,
      category,
      description,
    } => {
      let patch = IssuePatch {
        category,
        description,
        priority,
        status,
      };
      if patch == IssuePatch::default() {
        return Err(eyre!("Nothing to update, pass at least one of --status, --priority, --category, --description"));
      }
      print_outcome(cache.mutate(MutationSpec::UpdateIssue { id, patch }).await?);
    }
    Command::DeleteIssue { id } => {
      print_outcome(cache.mutate(MutationSpec::DeleteIssue { id }).await?);
    }
    Command::Scan => {
      let scan = cache.run_maintenance_scan().await?;
      println!("{}", scan.message);
      println!(
        "{} vessels, {} updated ({} active, {} under maintenance)",
        scan.total, scan.updated, scan.active, scan.under_maintenance
      );
      for detail in scan.details.iter().filter(|d| d.status_changed) {
        println!(
          "  {:<24} {} -> {} ({} open issues)",
          detail.vessel_name, detail.previous_status, detail.current_status, detail.open_issues
        );
      }
    }
    Command::Assigned => {
      if config.session.user_id.is_none() {
        warn!("No session user configured, my-issues may be empty");
      }
      let vessels = cache.assigned_vessels(IssueFilter::default()).await?;
      for vessel in &vessels {
        print_assigned(vessel);
      }
    }
    Command::Recommend { category, vessel_type } => {
      if FleetQuery::recommendations(category.as_str(), vessel_type.as_str()).is_none() {
        return Err(eyre!("Both --category and --type must be non-empty"));
      }
      for issue in cache.recommendations(&category, &vessel_type).await? {
        print_issue(&issue);
      }
    }
  }

  Ok(())
}

/// Observe `query` until its fetch settles.
async fn settled(cache: &FleetCache, query: FleetQuery) -> Result<QueryView<Record>> {
  let mut observer = cache.observe(query);
  let view = observer.settled().await;
  if let Some(err) = view.error() {
    return Err(err.clone().into());
  }
  Ok(view)
}

fn print_records(view: &QueryView<Record>) {
  for record in view.data().unwrap_or_default() {
    match record {
      Record::Vessel(vessel) => print_vessel(vessel),
      Record::Issue(issue) => print_issue(issue),
    }
  }
  if let Some(meta) = view.pagination() {
    println!("-- page {}/{} ({} total)", meta.page, meta.total_pages, meta.total);
  }
}

fn print_vessel(vessel: &Vessel) {
  println!(
    "{:<26} {:<24} {:<10} {:<12} {:<18} {}",
    vessel.id,
    vessel.name,
    vessel.imo,
    vessel.flag,
    vessel.status,
    vessel.open_issues_count.unwrap_or(0)
  );
}

fn print_issue(issue: &Issue) {
  println!(
    "{:<26} {:<26} {:<12} {:<9} {:<12} {}",
    issue.id,
    issue.vessel.summary().map_or(issue.vessel_id(), |v| v.name.as_str()),
    issue.category,
    issue.priority,
    issue.status,
    issue.description
  );
}

fn print_assigned(vessel: &AssignedVessel) {
  println!(
    "{:<26} {:<24} {:<10} {} open",
    vessel.id,
    vessel.name,
    vessel.imo.as_deref().unwrap_or("-"),
    vessel.open_issues_count
  );
}

fn print_outcome(outcome: MutationOutcome) {
  match outcome {
    MutationOutcome::Vessel(vessel) => print_vessel(&vessel),
    MutationOutcome::Issue(issue) => print_issue(&issue),
    MutationOutcome::Deleted { message } => println!("{}", message),
  }
}
