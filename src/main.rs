mod api;
mod cache;
mod config;
mod db;
mod logging;
mod session;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use api::{spending_summary, Expense, HttpExpenseApi, NewExpense};
use db::{KeyValueStore, MemoryStore, SqliteStore};
use session::Session;
use sync::{is_provisional, ExpenseController, NetworkEvents, NetworkState, SyncStatus};

#[derive(Parser, Debug)]
#[command(name = "spendsync")]
#[command(about = "Expense tracking that keeps working offline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/spendsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Do not contact the backend; queue every change
  #[arg(long, global = true)]
  offline: bool,

  /// Keep all state in memory for this run
  #[arg(long, global = true)]
  ephemeral: bool,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Log in as an existing user
  Login {
    username: String,
    #[arg(short, long)]
    password: String,
  },
  /// Forget the current user and cached data
  Logout,
  /// Show the logged-in user
  Whoami,
  /// List expenses
  List {
    /// Only the current user's expenses
    #[arg(long)]
    mine: bool,
  },
  /// Show one expense
  Show { id: String },
  /// Record a new expense
  Add(ExpenseFields),
  /// Replace an expense's fields
  Update {
    id: String,
    #[command(flatten)]
    fields: ExpenseFields,
  },
  /// Delete an expense
  Delete { id: String },
  /// Replay queued changes now
  Sync,
  /// Show connectivity and queued changes
  Status,
  /// Spending per category
  Summary,
  /// Probe the backend and replay queued changes on reconnect
  Watch,
}

#[derive(clap::Args, Debug)]
struct ExpenseFields {
  #[arg(long)]
  amount: f64,
  #[arg(long)]
  description: String,
  #[arg(long)]
  category: String,
  /// YYYY-MM-DD, defaults to today
  #[arg(long)]
  date: Option<String>,
  #[arg(long)]
  name: Option<String>,
}

impl ExpenseFields {
  fn into_new_expense(self, user_id: &str) -> Result<NewExpense> {
    NewExpense::new(
      self.amount,
      self.description,
      self.category,
      self.date,
      user_id,
      self.name,
    )
    .map_err(|e| eyre!(e))
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;

  let _log_guard = logging::init(
    &data_dir.join("logs"),
    config.log_level.as_deref().unwrap_or("info"),
    args.verbose,
  )?;

  let storage: Arc<dyn KeyValueStore> = if args.ephemeral {
    Arc::new(MemoryStore::new())
  } else {
    Arc::new(SqliteStore::open(&data_dir)?)
  };

  let api = Arc::new(HttpExpenseApi::new(&config)?);
  let network = if args.offline {
    NetworkState::offline()
  } else {
    sync::probe(&reqwest::Client::new(), api.base_url(), Duration::from_secs(3)).await
  };
  info!(online = network.is_online(), "starting");

  let controller = ExpenseController::new(api.clone(), storage.clone(), &config, network);
  controller.load_pending().await?;
  let session = Session::new(storage);

  match args.command {
    Command::Login { username, password } => {
      let user = session
        .login(controller.executor(), controller.api(), &username, &password)
        .await?;
      println!("Logged in as {} (id {})", user.username, user.id);
    }
    Command::Logout => {
      session.logout(controller.executor())?;
      println!("Logged out");
    }
    Command::Whoami => match session.current_user()? {
      Some(user) => println!("{} (id {})", user.username, user.id),
      None => println!("Not logged in"),
    },
    Command::List { mine } => {
      let user_id = if mine {
        Some(require_user(&session)?.id)
      } else {
        None
      };
      let records = controller.fetch_expenses(user_id.as_deref()).await;
      let records = report_list(&controller, records);
      print_expenses(&records);
    }
    Command::Show { id } => {
      let expense = controller.fetch_expense(&id).await;
      report_notice(&controller);
      print_expense(&expense?);
    }
    Command::Add(fields) => {
      let user = require_user(&session)?;
      let expense = controller
        .create_expense(fields.into_new_expense(&user.id)?)
        .await?;
      if is_provisional(&expense.id) {
        println!("Queued {} (will sync when online)", expense.id);
      } else {
        println!("Created {}", expense.id);
      }
    }
    Command::Update { id, fields } => {
      let user = require_user(&session)?;
      let expense = controller
        .update_expense(&id, fields.into_new_expense(&user.id)?)
        .await?;
      report_notice(&controller);
      print_expense(&expense);
    }
    Command::Delete { id } => {
      controller.delete_expense(&id).await?;
      report_notice(&controller);
      println!("Deleted {}", id);
    }
    Command::Sync => {
      if controller.is_offline() {
        println!(
          "Offline; {} operations pending",
          controller.status().pending_count
        );
      } else {
        let summary = controller.sync_pending().await;
        report_notice(&controller);
        println!(
          "Synced {} operations, {} no longer applied, {} dropped, {} pending",
          summary.succeeded,
          summary.moot,
          summary.dropped.len(),
          summary.remaining.len()
        );
      }
    }
    Command::Status => print_status(&controller).await,
    Command::Summary => {
      let user_id = session.current_user()?.map(|u| u.id);
      let records = controller.fetch_expenses(user_id.as_deref()).await;
      let summary = spending_summary(&report_list(&controller, records));
      println!("Total: {:.2} across {} expenses", summary.total, summary.count);
      for category in summary.categories {
        println!(
          "  {:<16} {:>10.2}  {:>5.1}%  ({})",
          category.category, category.amount, category.percentage, category.count
        );
      }
    }
    Command::Watch => watch(&controller, &api, &config).await?,
  }

  Ok(())
}

fn require_user(session: &Session) -> Result<api::User> {
  session
    .current_user()?
    .ok_or_else(|| eyre!("Not logged in. Run `spendsync login` first."))
}

fn report_notice(controller: &ExpenseController) {
  if let Some(notice) = controller.view().notice {
    eprintln!("{}", notice.message);
  }
  controller.clear_error();
}

/// Print how fresh a fetched list is and return what should be shown.
fn report_list(
  controller: &ExpenseController,
  fetched: std::result::Result<Vec<Expense>, api::ApiError>,
) -> Vec<Expense> {
  let view = controller.view();
  let list = &view.expenses;
  if let Some((kind, message)) = list.error() {
    eprintln!("{}", message);
    if list.has_stale_data() {
      eprintln!("Showing the last loaded list ({})", kind);
    }
  } else if list.is_stale() {
    match list.synced_at() {
      Some(at) => eprintln!("Showing cached data from {}", at.to_rfc3339()),
      None => eprintln!("Showing cached data"),
    }
  }
  controller.clear_error();
  fetched.unwrap_or_else(|_| view.expenses().to_vec())
}

fn print_expenses(expenses: &[Expense]) {
  if expenses.is_empty() {
    println!("No expenses");
    return;
  }
  for expense in expenses {
    println!(
      "{}{:<14} {:<12} {:<16} {:>10.2}  {}",
      if is_provisional(&expense.id) { "*" } else { " " },
      expense.id,
      expense.date.as_deref().unwrap_or("-"),
      expense.category.as_deref().unwrap_or("Other"),
      expense.amount,
      expense.description
    );
  }
}

fn print_expense(expense: &Expense) {
  println!("id:          {}", expense.id);
  if let Some(name) = &expense.name {
    println!("name:        {}", name);
  }
  println!("amount:      {:.2}", expense.amount);
  println!("description: {}", expense.description);
  println!("category:    {}", expense.category.as_deref().unwrap_or("Other"));
  println!("date:        {}", expense.date.as_deref().unwrap_or("-"));
  if is_provisional(&expense.id) {
    println!("(pending sync)");
  }
}

async fn print_status(controller: &ExpenseController) {
  let status = controller.status();
  println!("Mode:      {}", if status.is_offline { "offline" } else { "online" });
  match status.last_sync {
    Some(at) => println!("Last sync: {}", at.to_rfc3339()),
    None => println!("Last sync: never"),
  }
  match controller.executor().cache().len() {
    Ok(count) => println!("Cached:    {} responses", count),
    Err(e) => warn!(error = %e, "failed to count cache entries"),
  }
  println!("Pending:   {}", status.pending_count);
  for op in controller.pending_operations().await {
    println!(
      "  {} {:?} {} (retries {})",
      op.id,
      op.kind(),
      op.target_id().unwrap_or("-"),
      op.retry_count
    );
  }
}

/// Follow connectivity until Ctrl-C, replaying queued changes on reconnect.
async fn watch(
  controller: &Arc<ExpenseController>,
  api: &HttpExpenseApi,
  config: &config::Config,
) -> Result<()> {
  let interval = Duration::from_secs(config.connectivity.probe_interval_secs.max(1));
  let mut events = NetworkEvents::new(api.base_url().clone(), interval);
  println!("Watching {} (Ctrl-C to stop)", api.base_url());

  // Keep the notice so a network failure is retried once the backend answers
  if let Err(e) = controller.fetch_expenses(None).await {
    eprintln!("{}", e.kind.user_message(api::Action::FetchList));
  }

  let mut status = controller.subscribe_status();
  let status_task = tokio::spawn(async move {
    let mut last = status.borrow_and_update().clone();
    while status.changed().await.is_ok() {
      let current = status.borrow_and_update().clone();
      print_status_change(&last, &current);
      last = current;
    }
  });

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.next() => {
        let Some(state) = event else { break };
        let replay = controller.on_network_change(state).await;
        if let Some(handle) = replay {
          tokio::spawn(async move {
            match handle.await {
              Ok(summary) if !summary.is_noop() => println!(
                "Synced {} operations, {} dropped, {} pending",
                summary.succeeded,
                summary.dropped.len(),
                summary.remaining.len()
              ),
              Ok(_) => {}
              Err(e) => warn!(error = %e, "replay task failed"),
            }
          });
        }
        if !controller.is_offline() {
          if let Some(Ok(records)) = controller.retry_last().await {
            println!("Refreshed {} expenses", records.len());
          }
        }
      }
    }
  }

  status_task.abort();
  Ok(())
}

fn print_status_change(before: &SyncStatus, after: &SyncStatus) {
  if before.is_offline != after.is_offline {
    println!("{}", if after.is_offline { "Went offline" } else { "Back online" });
  }
  if before.is_syncing != after.is_syncing {
    println!("{}", if after.is_syncing { "Syncing..." } else { "Sync finished" });
  }
  if before.pending_count != after.pending_count {
    println!("{} operations pending", after.pending_count);
  }
}
