mod ai;
mod db;
mod error;
mod ingest;
mod models;
mod run;
mod search;
mod settings;
mod sources;
mod sponsors;
mod stage;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use db::Database;
use error::PipelineError;
use models::{RunStatus, Source, Stage, StageFilter};
use run::{RunController, StdoutSink};
use settings::SettingsUpdate;

#[derive(Parser)]
#[command(name = "pursuit")]
#[command(about = "Job application pipeline - ingest, qualify, apply, generate")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// List postings
    List {
        /// Filter by stage (discovered, ready, applied, all)
        #[arg(short, long, default_value = "all")]
        stage: String,
    },

    /// Show posting details
    Show {
        /// Posting ID
        id: i64,
    },

    /// Import a pasted posting (draft is shown for review first)
    Import {
        /// File to read, or '-' for stdin
        file: Option<PathBuf>,

        /// Persist without the review prompt
        #[arg(long)]
        yes: bool,
    },

    /// Ingest payloads from non-interactive sources
    Ingest {
        #[command(subcommand)]
        command: IngestCommands,
    },

    /// Poll the search API and ingest the results
    Search {
        /// Search terms
        #[arg(long, default_value = "software engineer")]
        what: String,

        /// Location filter
        #[arg(long = "where", default_value = "london")]
        location: String,

        /// Number of result pages to fetch
        #[arg(long, default_value = "1")]
        pages: u32,
    },

    /// Manage the visa sponsor register
    Sponsors {
        #[command(subcommand)]
        command: SponsorCommands,
    },

    /// Promote a posting one stage forward
    Advance {
        /// Posting ID
        id: i64,

        /// Target stage (ready, applied)
        stage: String,
    },

    /// Demote a posting one stage back (explicit manual action)
    Demote {
        /// Posting ID
        id: i64,

        /// Target stage (discovered, ready)
        stage: String,
    },

    /// Start a generation run for a posting and stream it
    Generate {
        /// Posting ID
        id: i64,

        /// Model to use
        #[arg(short, long, default_value = "sonnet")]
        model: String,
    },

    /// Supersede any previous run and stream a fresh one
    Regenerate {
        /// Posting ID
        id: i64,

        /// Model to use
        #[arg(short, long, default_value = "sonnet")]
        model: String,
    },

    /// Show which ingestion sources are enabled
    Sources,

    /// Manage settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },

    /// Manage portfolio projects used in generation prompts
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
}

#[derive(Subcommand)]
enum IngestCommands {
    /// Ingest a webhook delivery payload (JSON object)
    Webhook {
        /// File containing the payload
        file: PathBuf,
    },

    /// Ingest visa-feed posting records (JSON array)
    Visa {
        /// File containing the records
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum SponsorCommands {
    /// Fetch the sponsor feed and replace the local register
    Refresh,

    /// Cross-reference postings against the register
    Match,
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Show current settings
    Show,

    /// Update settings (unset flags keep their current value)
    Set {
        #[arg(long)]
        adzuna_app_id: Option<String>,

        #[arg(long)]
        adzuna_app_key: Option<String>,

        #[arg(long)]
        webhook_secret: Option<String>,

        #[arg(long)]
        sponsor_feed_url: Option<String>,

        #[arg(long)]
        max_projects: Option<usize>,

        /// Locked project ids, comma separated (replaces the list)
        #[arg(long, value_delimiter = ',')]
        lock: Option<Vec<i64>>,

        /// AI-selectable project ids, comma separated (replaces the list)
        #[arg(long = "ai-select", value_delimiter = ',')]
        ai_select: Option<Vec<i64>>,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Add a project
    Add {
        /// Name for this project
        name: String,

        /// Path to a summary file
        file: PathBuf,
    },

    /// List projects
    List,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut db = Database::open()?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::List { stage } => {
            db.ensure_initialized()?;
            let filter = StageFilter::parse(&stage)
                .ok_or_else(|| anyhow!("Unknown stage '{}'. Use discovered, ready, applied or all.", stage))?;
            let postings = db.list_postings(filter)?;
            if postings.is_empty() {
                println!("No postings found.");
            } else {
                println!(
                    "{:<6} {:<12} {:<11} {:<32} {:<20} {:>5}",
                    "ID", "STAGE", "SOURCE", "TITLE", "COMPANY", "VISA"
                );
                println!("{}", "-".repeat(90));
                for posting in postings {
                    let visa = match posting.visa_sponsor {
                        Some(true) => "yes",
                        Some(false) => "no",
                        None => "-",
                    };
                    println!(
                        "{:<6} {:<12} {:<11} {:<32} {:<20} {:>5}",
                        posting.id,
                        posting.stage,
                        posting.source,
                        truncate(&posting.title, 30),
                        truncate(&posting.company.unwrap_or_default(), 18),
                        visa
                    );
                }
            }
        }

        Commands::Show { id } => {
            db.ensure_initialized()?;
            match db.get_posting(id)? {
                Some(posting) => {
                    println!("Posting #{}", posting.id);
                    println!("Title: {}", posting.title);
                    if let Some(company) = &posting.company {
                        println!("Company: {}", company);
                    }
                    println!("Stage: {}", posting.stage);
                    println!("Source: {}", posting.source);
                    if let Some(url) = &posting.url {
                        println!("URL: {}", url);
                    }
                    match posting.visa_sponsor {
                        Some(true) => println!("Visa sponsor: yes"),
                        Some(false) => println!("Visa sponsor: no"),
                        None => {}
                    }
                    println!("Discovered: {}", posting.discovered_at);
                    if let Some((run_id, status, transcript)) = db.latest_run(id)? {
                        println!("\nLatest run #{} ({})", run_id, status);
                        if !transcript.is_empty() {
                            println!("--- Transcript ---\n{}", transcript);
                        }
                    }
                    if let Some(description) = &posting.description {
                        println!("\n--- Description ---\n{}", description);
                    }
                }
                None => {
                    println!("Posting #{} not found.", id);
                }
            }
        }

        Commands::Import { file, yes } => {
            db.ensure_initialized()?;
            let payload = read_payload(file.as_deref())?;
            let draft = ingest::infer_draft(&payload)?;

            println!("Inferred draft:");
            println!("  Title: {}", draft.title);
            println!("  Company: {}", draft.company.as_deref().unwrap_or("(unknown)"));
            println!("  URL: {}", draft.url.as_deref().unwrap_or("(none)"));

            let confirmed = yes || prompt_confirm("Persist this posting? [y/N] ")?;
            if !confirmed {
                println!("Draft discarded; nothing was saved.");
                return Ok(());
            }

            let ingested = ingest::confirm_draft(&db, &draft)?;
            if ingested.created {
                println!("Added posting #{} (stage: discovered)", ingested.id);
            } else {
                println!("Already tracked as posting #{}", ingested.id);
            }
        }

        Commands::Ingest { command } => {
            db.ensure_initialized()?;
            let settings = db.load_settings()?;
            match command {
                IngestCommands::Webhook { file } => {
                    if !sources::is_enabled(&settings, Source::Webhook) {
                        return Err(anyhow!(
                            "webhook source is disabled. Set webhook_secret with 'pursuit settings set'."
                        ));
                    }
                    let payload = std::fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read {}", file.display()))?;
                    let ingested = ingest::normalize(&db, Source::Webhook, &payload)?;
                    if ingested.created {
                        println!("Added posting #{}", ingested.id);
                    } else {
                        println!("Duplicate of posting #{}; stage untouched", ingested.id);
                    }
                }
                IngestCommands::Visa { file } => {
                    if !sources::is_enabled(&settings, Source::VisaFeed) {
                        return Err(anyhow!(
                            "visa-feed source is disabled. Set sponsor_feed_url with 'pursuit settings set'."
                        ));
                    }
                    let payload = std::fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read {}", file.display()))?;
                    let stats = ingest::ingest_json_array(&db, Source::VisaFeed, &payload)?;
                    print_ingest_stats(&stats);
                }
            }
        }

        Commands::Search { what, location, pages } => {
            db.ensure_initialized()?;
            let settings = db.load_settings()?;
            let client = search::SearchClient::from_settings(&settings)?;

            let mut totals = ingest::IngestStats::default();
            for page in 1..=pages.max(1) {
                println!("Fetching page {}...", page);
                let results = client.fetch_page(&what, &location, page)?;
                let stats = search::ingest_results(&db, &results);
                totals.found += stats.found;
                totals.added += stats.added;
                totals.duplicates += stats.duplicates;
                totals.errors += stats.errors;
            }
            print_ingest_stats(&totals);
        }

        Commands::Sponsors { command } => {
            db.ensure_initialized()?;
            match command {
                SponsorCommands::Refresh => {
                    let settings = db.load_settings()?;
                    let count = sponsors::refresh_from_feed(&mut db, &settings)?;
                    println!("Sponsor register refreshed: {} organisations", count);
                }
                SponsorCommands::Match => {
                    if db.sponsor_count()? == 0 {
                        println!("Sponsor register is empty. Run 'pursuit sponsors refresh' first.");
                        return Ok(());
                    }
                    let stats = sponsors::cross_reference(&db)?;
                    println!("Cross-referenced {} postings:", stats.checked);
                    println!("  Sponsors:     {}", stats.flagged);
                    println!("  Non-sponsors: {}", stats.unflagged);
                    if stats.skipped > 0 {
                        println!("  Skipped (no company): {}", stats.skipped);
                    }
                }
            }
        }

        Commands::Advance { id, stage } => {
            db.ensure_initialized()?;
            let to = parse_stage(&stage)?;
            let new_stage = stage::transition(&db, id, to, false)?;
            println!("Posting #{} is now '{}'", id, new_stage);
        }

        Commands::Demote { id, stage } => {
            db.ensure_initialized()?;
            let to = parse_stage(&stage)?;
            let new_stage = stage::transition(&db, id, to, true)?;
            println!("Posting #{} demoted to '{}'", id, new_stage);
        }

        Commands::Generate { id, model } => {
            db.ensure_initialized()?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_generation(db, id, &model, false))?;
        }

        Commands::Regenerate { id, model } => {
            db.ensure_initialized()?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_generation(db, id, &model, true))?;
        }

        Commands::Sources => {
            db.ensure_initialized()?;
            let settings = db.load_settings()?;
            let enabled = sources::enabled_sources(&settings);
            for source in Source::ALL {
                if enabled.contains(&source) {
                    println!("{:<11} enabled", source.as_str());
                } else {
                    let missing: Vec<&str> = sources::required_credentials(source).to_vec();
                    println!("{:<11} disabled (requires: {})", source.as_str(), missing.join(", "));
                }
            }
        }

        Commands::Settings { command } => {
            db.ensure_initialized()?;
            match command {
                SettingsCommands::Show => {
                    let settings = db.load_settings()?;
                    println!("adzuna_app_id:    {}", settings.adzuna_app_id.as_deref().unwrap_or("(not set)"));
                    println!("adzuna_app_key:   {}", mask(settings.adzuna_app_key.as_deref()));
                    println!("webhook_secret:   {}", mask(settings.webhook_secret.as_deref()));
                    println!("sponsor_feed_url: {}", settings.sponsor_feed_url.as_deref().unwrap_or("(not set)"));
                    println!("max_projects:     {}", settings.max_projects);
                    println!("locked projects:  {:?}", settings.locked_project_ids);
                    println!("ai-selectable:    {:?}", settings.ai_selectable_project_ids);
                }
                SettingsCommands::Set {
                    adzuna_app_id,
                    adzuna_app_key,
                    webhook_secret,
                    sponsor_feed_url,
                    max_projects,
                    lock,
                    ai_select,
                } => {
                    let current = db.load_settings()?;
                    let next = settings::apply_update(
                        &current,
                        SettingsUpdate {
                            adzuna_app_id,
                            adzuna_app_key,
                            webhook_secret,
                            sponsor_feed_url,
                            max_projects,
                            locked_project_ids: lock,
                            ai_selectable_project_ids: ai_select,
                        },
                    )?;
                    db.save_settings(&next)?;
                    println!("Settings saved.");
                }
            }
        }

        Commands::Project { command } => {
            db.ensure_initialized()?;
            match command {
                ProjectCommands::Add { name, file } => {
                    let summary = std::fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read project file: {}", file.display()))?;
                    let project_id = db.add_project(&name, summary.trim())?;
                    println!("Added project '{}' (ID: {})", name, project_id);
                }
                ProjectCommands::List => {
                    let projects = db.list_projects()?;
                    if projects.is_empty() {
                        println!("No projects found.");
                    } else {
                        println!("{:<6} {:<20} {:<50}", "ID", "NAME", "SUMMARY");
                        println!("{}", "-".repeat(78));
                        for project in projects {
                            println!(
                                "{:<6} {:<20} {:<50}",
                                project.id,
                                truncate(&project.name, 18),
                                truncate(&project.summary, 48)
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

async fn run_generation(db: Database, posting_id: i64, model: &str, regenerate: bool) -> Result<()> {
    let posting = db
        .get_posting(posting_id)?
        .ok_or(PipelineError::PostingNotFound { id: posting_id })?;
    let app_settings = db.load_settings()?;
    let projects = db.list_projects()?;
    let selected = settings::select_projects(&app_settings, &projects);
    let prompt = ai::build_generation_prompt(&posting, &selected);

    let spec = ai::resolve_model(model)?;
    let backend = ai::create_backend(&spec)?;

    let store = Arc::new(Mutex::new(db));
    let controller = RunController::new(store);

    println!(
        "{} for posting #{} ({}) with {}...\n",
        if regenerate { "Regenerating" } else { "Generating" },
        posting.id,
        truncate(&posting.title, 40),
        spec.short_name
    );

    let sink = Arc::new(StdoutSink);
    let handle = if regenerate {
        controller.regenerate(posting_id, &prompt, backend.as_ref(), sink).await?
    } else {
        controller.start(posting_id, &prompt, backend.as_ref(), sink).await?
    };
    let run_id = handle.run_id;

    tokio::select! {
        run = handle.wait() => match run.status {
            RunStatus::Completed => {
                println!("\n\n(run #{} completed, {} chunks)", run.id, run.chunks.len());
            }
            RunStatus::Failed => {
                return Err(PipelineError::GenerationFailed {
                    run_id: run.id,
                    reason: run.error.unwrap_or_else(|| "unknown".to_string()),
                }
                .into());
            }
            status => {
                println!("\n\n(run #{} ended: {})", run.id, status);
            }
        },
        _ = tokio::signal::ctrl_c() => {
            controller.stop(posting_id).await;
            println!("\n\n(run #{} stopped)", run_id);
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pursuit=warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn parse_stage(s: &str) -> Result<Stage> {
    Stage::parse(s)
        .ok_or_else(|| anyhow!("Unknown stage '{}'. Use discovered, ready or applied.", s))
}

fn read_payload(file: Option<&std::path::Path>) -> Result<String> {
    match file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read from stdin")?;
            Ok(buf)
        }
    }
}

fn prompt_confirm(question: &str) -> Result<bool> {
    print!("{}", question);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

fn print_ingest_stats(stats: &ingest::IngestStats) {
    println!("\nResults:");
    println!("  Records found: {}", stats.found);
    println!("  Postings added: {}", stats.added);
    println!("  Duplicates:     {}", stats.duplicates);
    if stats.errors > 0 {
        println!("  Errors:         {}", stats.errors);
    }
}

fn mask(value: Option<&str>) -> &'static str {
    if value.is_some_and(|v| !v.is_empty()) {
        "(set)"
    } else {
        "(not set)"
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max.saturating_sub(3)])
    }
}
