use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use taskflow_core::config::{ConfigPatch, TaskflowConfig, load_config, patch_config};
use taskflow_core::db;
use taskflow_core::export::{
    build_patched_snapshot, confirm_export, render_export_filename, write_snapshot,
};
use taskflow_core::filter::{SortKey, StemSelector, TaskFilter, filter_tasks, sort_tasks};
use taskflow_core::merge::{Conflict, MergeEngine, Resolution};
use taskflow_core::model::{ProjectSnapshot, Task, TaskField};
use taskflow_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use taskflow_core::scrapbox::{ProjectReadApi, ScrapboxClient};
use taskflow_core::sync::{
    RefreshOptions, current_view, load_snapshot_data, record_edit, refresh_with_api,
};

#[derive(Debug, Parser)]
#[command(
    name = "taskflow",
    version,
    about = "Snapshot-based task board for Scrapbox-style wiki projects"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Initialize the .taskflow runtime layout")]
    Init(InitArgs),
    #[command(about = "Refresh tasks from the wiki service")]
    Fetch(FetchArgs),
    #[command(about = "Load a snapshot from a local export file")]
    Load(LoadArgs),
    #[command(about = "List tasks from the current snapshot")]
    Board(BoardArgs),
    #[command(about = "Edit a task field (status, stage, assigned_to)")]
    Set(SetArgs),
    #[command(about = "Show runtime, cache, and local change status")]
    Status,
    #[command(about = "Export changed pages as a patched snapshot")]
    Export(ExportArgs),
    #[command(about = "Show or edit configuration")]
    Config(ConfigArgs),
    #[command(about = "Inspect or clear the snapshot cache")]
    Cache(CacheArgs),
    #[command(about = "Discard all local edits and baselines")]
    Reset,
    #[command(about = "Test connectivity against the wiki service")]
    Check,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .taskflow/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct FetchArgs {
    #[arg(long, help = "Force a full snapshot pull even without a new backup")]
    full: bool,
}

#[derive(Debug, Args)]
struct LoadArgs {
    path: PathBuf,
}

#[derive(Debug, Args)]
struct BoardArgs {
    #[arg(long, value_name = "TAG", help = "Only tasks with this status tag")]
    status: Option<String>,
    #[arg(long, value_name = "TAG", help = "Only tasks with this stage tag")]
    stage: Option<String>,
    #[arg(long, value_name = "TAG", help = "Only tasks with this assignee tag")]
    assignee: Option<String>,
    #[arg(long, value_name = "NAME", help = "Only tasks under this project stem")]
    stem: Option<String>,
    #[arg(long, help = "Only tasks with no project stem")]
    no_stem: bool,
    #[arg(long, default_value = "smart", value_name = "KEY")]
    sort: String,
    #[arg(long, help = "Include completed tasks")]
    show_completed: bool,
    #[arg(long, help = "Include inactive-stage tasks")]
    show_inactive: bool,
    #[arg(long, help = "Include tasks whose start date is in the future")]
    show_before_start: bool,
}

#[derive(Debug, Args)]
struct SetArgs {
    #[arg(value_name = "TASK", help = "Task id or exact title")]
    task: String,
    #[arg(value_name = "FIELD", help = "status, stage, or assigned_to")]
    field: String,
    #[arg(value_name = "VALUE", help = "New value; empty or bare prefix clears")]
    value: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long, help = "Skip the refresh that normally runs before export")]
    no_fetch: bool,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
enum ConfigSubcommand {
    Show,
    Set { key: String, value: String },
}

#[derive(Debug, Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheSubcommand,
}

#[derive(Debug, Subcommand)]
enum CacheSubcommand {
    Status,
    Clear {
        #[arg(long, help = "Clear cached snapshots for every project")]
        all: bool,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Fetch(args)) => run_fetch(&runtime, args),
        Some(Commands::Load(args)) => run_load(&runtime, args),
        Some(Commands::Board(args)) => run_board(&runtime, args),
        Some(Commands::Set(args)) => run_set(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Export(args)) => run_export(&runtime, args),
        Some(Commands::Config(ConfigArgs { command })) => match command {
            ConfigSubcommand::Show => run_config_show(&runtime),
            ConfigSubcommand::Set { key, value } => run_config_set(&runtime, &key, &value),
        },
        Some(Commands::Cache(CacheArgs { command })) => match command {
            CacheSubcommand::Status => run_cache_status(&runtime),
            CacheSubcommand::Clear { all } => run_cache_clear(&runtime, all),
        },
        Some(Commands::Reset) => run_reset(&runtime),
        Some(Commands::Check) => run_check(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };
    let paths = resolve_paths(&context, &overrides)?;
    if runtime.diagnostics {
        println!("[diagnostics]\n{}\n", paths.diagnostics());
    }
    Ok(paths)
}

fn ready_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready(&paths, &status)?;
    Ok(paths)
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized taskflow runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("exports_dir: {}", normalize_for_display(&paths.exports_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    Ok(())
}

fn run_fetch(runtime: &RuntimeOptions, args: FetchArgs) -> Result<()> {
    let paths = ready_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut connection = db::open_store(&paths)?;
    let mut engine = db::load_engine_state(&connection)?;
    let mut client = ScrapboxClient::from_config(&config)?;

    let outcome = refresh_with_api(
        &connection,
        &config,
        &mut engine,
        &mut client,
        &RefreshOptions {
            force_full: args.full,
        },
    )?;
    if !outcome.conflicts.is_empty() {
        engine.resolve_conflicts(&outcome.conflicts, Resolution::LocalWins);
    }
    db::save_engine_state(&mut connection, &engine)?;

    println!("fetch complete");
    println!("mode: {}", mode_label(outcome.report.mode));
    println!(
        "backup_id: {}",
        outcome.report.backup_id.as_deref().unwrap_or("<none>")
    );
    println!("tasks: {}", outcome.report.task_count);
    if outcome.report.refreshed_pages > 0 {
        println!("refreshed_pages: {}", outcome.report.refreshed_pages);
    }
    println!("requests: {}", outcome.report.request_count);
    print_warnings(&outcome.report.warnings);
    print_conflicts(&outcome.conflicts);
    Ok(())
}

fn run_load(runtime: &RuntimeOptions, args: LoadArgs) -> Result<()> {
    let paths = ready_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut connection = db::open_store(&paths)?;
    let mut engine = db::load_engine_state(&connection)?;

    let content = fs::read_to_string(&args.path)
        .with_context(|| format!("failed to read {}", args.path.display()))?;
    let snapshot: ProjectSnapshot = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", args.path.display()))?;

    let (_tasks, conflicts, report) =
        load_snapshot_data(&connection, &config, &mut engine, snapshot)?;
    if !conflicts.is_empty() {
        engine.resolve_conflicts(&conflicts, Resolution::LocalWins);
    }
    db::save_engine_state(&mut connection, &engine)?;

    println!("loaded {}", normalize_for_display(&args.path));
    println!("backup_id: {}", report.backup_id);
    println!("tasks: {}", report.task_count);
    print_warnings(&report.warnings);
    print_conflicts(&conflicts);
    Ok(())
}

fn run_board(runtime: &RuntimeOptions, args: BoardArgs) -> Result<()> {
    let paths = ready_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let connection = db::open_store(&paths)?;
    let engine = db::load_engine_state(&connection)?;

    let Some(view) = current_view(&connection, &config, &engine)? else {
        println!("no snapshot loaded yet; run `taskflow fetch` or `taskflow load <file>`");
        return Ok(());
    };

    let Some(sort) = SortKey::parse(&args.sort) else {
        bail!(
            "unknown sort key: {} (expected smart, updated-desc, updated-asc, due-date-asc, due-date-desc, title-asc)",
            args.sort
        );
    };
    let stem = if args.no_stem {
        StemSelector::Unassigned
    } else {
        args.stem
            .clone()
            .map_or(StemSelector::Any, StemSelector::Named)
    };
    let filter = TaskFilter {
        status: args.status.clone(),
        stage: args.stage.clone(),
        assignee: args.assignee.clone(),
        stem,
        show_completed: args.show_completed,
        show_inactive: args.show_inactive,
        show_before_start: args.show_before_start,
    };

    let today = chrono::Local::now().date_naive();
    let mut tasks = filter_tasks(&view.tasks, &filter, today);
    sort_tasks(&mut tasks, sort);

    if tasks.is_empty() {
        println!("no tasks match the current filters");
        return Ok(());
    }

    let modified = engine.modified_task_ids();
    for task in &tasks {
        println!("{}", board_line(task, modified.contains(&task.id)));
    }
    println!();
    println!("{} task(s)", tasks.len());
    Ok(())
}

fn board_line(task: &Task, modified: bool) -> String {
    let marker = if modified { "*" } else { " " };
    let due = task.due_date.as_deref().unwrap_or("----------");
    let status = task.status.as_deref().unwrap_or("-");
    let stage = task.stage.as_deref().unwrap_or("-");
    let assignee = task.assigned_to.as_deref().unwrap_or("-");
    let stem = task
        .project_stem
        .as_deref()
        .map(|stem| format!(" [{stem}]"))
        .unwrap_or_default();
    format!("{marker} {due}  {status:<22} {stage:<16} {assignee:<20} {}{stem}  ({})", task.title, task.id)
}

fn run_set(runtime: &RuntimeOptions, args: SetArgs) -> Result<()> {
    let paths = ready_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut connection = db::open_store(&paths)?;
    let mut engine = db::load_engine_state(&connection)?;

    let Some(field) = TaskField::parse(&args.field) else {
        bail!(
            "unknown field: {} (expected status, stage, or assigned_to)",
            args.field
        );
    };
    let Some(view) = current_view(&connection, &config, &engine)? else {
        bail!("no snapshot loaded yet; run `taskflow fetch` or `taskflow load <file>`");
    };

    let edit = record_edit(&mut engine, &view.tasks, &args.task, field, &args.value)?;
    db::save_engine_state(&mut connection, &engine)?;

    println!("recorded edit for {} ({})", edit.task_title, edit.task_id);
    println!("field: {}", edit.field.as_str());
    println!("old: {}", edit.old_value.as_deref().unwrap_or("<unset>"));
    println!("new: {}", edit.new_value.as_deref().unwrap_or("<unset>"));

    // The engine accepts any value; the vocabulary only drives board
    // filters, so an off-vocabulary value is worth a heads-up, not an error.
    if let Some(value) = &edit.new_value {
        let vocabulary = match field {
            TaskField::Status => config.recognition.status_tag_set(),
            TaskField::Stage => config.recognition.stage_tag_set(),
            TaskField::AssignedTo => config.recognition.assignee_tag_set(),
        };
        if !vocabulary.contains(value) {
            println!("warning: {value} is not in the configured {} vocabulary", field.as_str());
        }
    }
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!(
        "exports_dir_exists: {}",
        format_flag(status.exports_dir_exists)
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!(
        "db: {}",
        match status.db_size_bytes {
            Some(size) => format!("{} ({size} bytes)", normalize_for_display(&paths.db_path)),
            None => "<missing>".to_string(),
        }
    );
    for warning in &status.warnings {
        println!("warning: {warning}");
    }
    if !status.db_exists {
        return Ok(());
    }

    let config = load_config(&paths.config_path)?;
    let connection = db::open_store(&paths)?;
    let engine = db::load_engine_state(&connection)?;
    let stats = engine.change_stats();
    println!("project: {}", config.project_name());
    println!(
        "last_backup: {}",
        db::last_backup_id(&connection, &config.project_name())?.unwrap_or_else(|| "<none>".to_string())
    );
    println!("modified_tasks: {}", stats.modified_tasks);
    println!("total_changes: {}", stats.total_changes);
    if stats.modified_tasks > 0 {
        let view = current_view(&connection, &config, &engine)?;
        for task_id in engine.modified_task_ids() {
            let title = view
                .as_ref()
                .and_then(|view| view.tasks.iter().find(|task| task.id == task_id))
                .map(|task| task.title.as_str())
                .unwrap_or("<not in current snapshot>");
            println!("  * {task_id}  {title}");
        }
    }
    Ok(())
}

fn run_export(runtime: &RuntimeOptions, args: ExportArgs) -> Result<()> {
    let paths = ready_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut connection = db::open_store(&paths)?;
    let mut engine = db::load_engine_state(&connection)?;

    if config.fetch_before_export() && !args.no_fetch {
        match ScrapboxClient::from_config(&config).and_then(|mut client| {
            refresh_with_api(
                &connection,
                &config,
                &mut engine,
                &mut client,
                &RefreshOptions::default(),
            )
        }) {
            Ok(outcome) => {
                if !outcome.conflicts.is_empty() {
                    engine.resolve_conflicts(&outcome.conflicts, Resolution::LocalWins);
                    print_conflicts(&outcome.conflicts);
                }
                db::save_engine_state(&mut connection, &engine)?;
                println!("pre-export refresh: {}", mode_label(outcome.report.mode));
            }
            Err(error) => {
                println!("warning: pre-export refresh failed, exporting current data ({error:#})");
            }
        }
    }

    let Some(mut view) = current_view(&connection, &config, &engine)? else {
        bail!("no snapshot loaded yet; nothing to export");
    };
    let modified = engine.modified_task_ids();
    if modified.is_empty() {
        println!("no local changes; nothing to export");
        return Ok(());
    }

    let patched = build_patched_snapshot(
        &view.snapshot,
        &view.tasks,
        &modified,
        &config.task_icon_pattern(),
    );
    if patched.pages.is_empty() {
        println!("modified tasks are not present in the cached snapshot; nothing to export");
        return Ok(());
    }

    let filename = render_export_filename(
        &config.filename_format(),
        &config.project_name(),
        &chrono_now(),
    );
    let path = write_snapshot(&paths.exports_dir, &filename, &patched)?;

    // Fold the exported pages back into the retained snapshot so the next
    // export diffs against what was shipped. Edits stay recorded.
    confirm_export(&mut view.snapshot, &patched);
    db::store_snapshot(&connection, &config.project_name(), &view.backup_id, &view.snapshot)?;

    println!("export complete");
    println!("file: {}", normalize_for_display(&path));
    println!("pages: {}", patched.pages.len());
    println!("pending_changes: {}", engine.change_stats().total_changes);
    Ok(())
}

fn chrono_now() -> chrono::NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn run_config_show(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;

    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("project.name: {}", config.project_name());
    println!("project.task_icon: {}", config.task_icon());
    println!("api.base_url: {}", config.api_base_url());
    println!(
        "api.token: {}",
        if config.auth_token().is_some() {
            "<set via TASKFLOW_TOKEN>"
        } else {
            "<unset>"
        }
    );
    println!(
        "recognition.status_tags: {}",
        config
            .recognition
            .status_tag_set()
            .into_iter()
            .collect::<Vec<_>>()
            .join(",")
    );
    println!(
        "recognition.exclude_tags: {}",
        config.recognition.exclude_tag_list().join(",")
    );
    println!("export.filename_format: {}", config.filename_format());
    println!("export.fetch_before_export: {}", config.fetch_before_export());
    Ok(())
}

fn run_config_set(runtime: &RuntimeOptions, key: &str, value: &str) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let patch = ConfigPatch::from_key_value(key, value)?;
    let wrote = patch_config(&paths.config_path, &patch)?;
    println!(
        "{}: {}",
        key,
        if wrote { "updated" } else { "unchanged" }
    );

    // Switching projects orphans cached snapshots and edits for the old
    // project; point the user at the reset path rather than doing it
    // silently.
    if key == "project.name" && wrote {
        println!("note: run `taskflow reset` and `taskflow cache clear` to drop state from the previous project");
    }
    Ok(())
}

fn run_cache_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = ready_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let connection = db::open_store(&paths)?;
    let info = db::cache_info(&connection)?;

    println!("cache status");
    println!("entries: {}", info.entries);
    println!("content_bytes: {}", info.content_bytes);
    println!(
        "last_backup: {}",
        db::last_backup_id(&connection, &config.project_name())?.unwrap_or_else(|| "<none>".to_string())
    );
    Ok(())
}

fn run_cache_clear(runtime: &RuntimeOptions, all: bool) -> Result<()> {
    let paths = ready_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let connection = db::open_store(&paths)?;
    let cleared = if all {
        db::clear_all_cache(&connection)?
    } else {
        db::clear_project_cache(&connection, &config.project_name())?
    };
    println!("cleared_snapshots: {cleared}");
    Ok(())
}

fn run_reset(runtime: &RuntimeOptions) -> Result<()> {
    let paths = ready_paths(runtime)?;
    let mut connection = db::open_store(&paths)?;
    let mut engine = db::load_engine_state(&connection)?;
    let stats = engine.change_stats();
    engine.clear_change_history();
    db::save_engine_state(&mut connection, &engine)?;
    println!("discarded_changes: {}", stats.total_changes);
    println!("discarded_tasks: {}", stats.modified_tasks);
    Ok(())
}

fn run_check(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut client = ScrapboxClient::from_config(&config)?;

    match client.project_info() {
        Ok(info) => {
            println!("connection ok");
            println!("project: {}", info.name);
            if let Some(display_name) = info.display_name {
                println!("display_name: {display_name}");
            }
            if let Some(count) = info.count {
                println!("pages: {count}");
            }
            println!("requests: {}", client.request_count());
            Ok(())
        }
        Err(error) => {
            println!("connection failed");
            println!("project: {}", config.project_name());
            println!("api: {}", config.api_base_url());
            Err(error)
        }
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn mode_label(mode: taskflow_core::sync::RefreshMode) -> &'static str {
    match mode {
        taskflow_core::sync::RefreshMode::FullSnapshot => "full snapshot",
        taskflow_core::sync::RefreshMode::IndividualPages => "individual pages",
        taskflow_core::sync::RefreshMode::UpToDate => "up to date",
    }
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!("warnings:");
    for warning in warnings {
        println!("  - {warning}");
    }
}

fn print_conflicts(conflicts: &[Conflict]) {
    if conflicts.is_empty() {
        return;
    }
    println!("conflicts ({}) - local edits were kept:", conflicts.len());
    for conflict in conflicts {
        println!("  {} ({})", conflict.task_title, conflict.task_id);
        for field in &conflict.fields {
            println!(
                "    {}: baseline {} | server {} | local {}",
                field.field.as_str(),
                field.original_value.as_deref().unwrap_or("<unset>"),
                field.server_value.as_deref().unwrap_or("<unset>"),
                field.local_value.as_deref().unwrap_or("<unset>"),
            );
        }
    }
}
