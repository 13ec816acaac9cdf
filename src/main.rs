#[macro_use]
extern crate log;

use std::{process::exit, thread, time::Duration};

use gridgate::{
    api, auth,
    db::{models::*, DbConn, DbPool},
    object_store, registry, Error, CONFIG, VERSION,
};

fn main() -> Result<(), Error> {
    parse_args();
    launch_info();

    init_logging();

    check_data_folder();
    auth::load_keys();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build a Tokio runtime");

    runtime.block_on(async {
        let pool = create_db_pool();

        // First configuration read; a failure is not fatal, the probes answer
        // 503 until the source becomes readable.
        if let Err(e) = registry::refresh().await {
            warn!("Could not load the initial configuration: {e:#?}");
        }

        // Best effort: sandbox endpoints answer 503 while storage is down
        if CONFIG.s3_credentials().is_some() {
            if let Err(e) = object_store::ensure_bucket(&CONFIG.sandbox_bucket()).await {
                warn!("Could not verify the sandbox bucket: {e:#?}");
            }
        }

        schedule_jobs(pool.clone());

        launch_rocket(pool).await
    })
}

const HELP: &str = "\
Gridgate control plane

USAGE:
    gridgate [FLAGS]

FLAGS:
    -h, --help       Prints help information
    -v, --version    Prints the app version
";

pub fn parse_args() {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        println!("{HELP}");
        exit(0);
    } else if pargs.contains(["-v", "--version"]) {
        println!("gridgate {VERSION}");
        exit(0);
    }

    let remaining = pargs.finish();
    if !remaining.is_empty() {
        eprintln!("Unrecognised arguments: {remaining:?}");
        eprintln!("{HELP}");
        exit(2);
    }
}

fn launch_info() {
    println!(
        "\
/--------------------------------------------------------------------\\
|                          Starting Gridgate                          |
|                           Version {VERSION:<10}                        |
\\--------------------------------------------------------------------/
"
    );
}

fn init_logging() {
    let level = match CONFIG.log_level().to_lowercase().parse::<log::LevelFilter>() {
        Ok(level) => level,
        Err(_) => {
            eprintln!("Log level must be one of: off, error, warn, info, debug, trace");
            exit(1);
        }
    };

    let mut logger = fern::Dispatch::new()
        .level(level)
        // Noisy dependencies stay at warn unless debugging them explicitly
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("rustls", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .level_for("rocket::server", log::LevelFilter::Warn)
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format(&CONFIG.log_timestamp_format()),
                record.target(),
                record.level(),
                message
            ))
        })
        .chain(std::io::stdout());

    if let Some(log_file) = CONFIG.log_file() {
        match fern::log_file(&log_file) {
            Ok(file) => logger = logger.chain(file),
            Err(e) => {
                eprintln!("Unable to open log file {log_file}: {e}");
                exit(1);
            }
        }
    }

    #[cfg(unix)]
    if CONFIG.use_syslog() {
        let syslog_fmt = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_USER,
            hostname: None,
            process: String::from("gridgate"),
            pid: 0,
        };
        match syslog::unix(syslog_fmt) {
            Ok(sl) => logger = logger.chain(sl),
            Err(e) => {
                eprintln!("Unable to connect to syslog: {e}");
                exit(1);
            }
        }
    }

    if let Err(e) = logger.apply() {
        eprintln!("Failed to activate logging: {e}");
        exit(1);
    }
}

fn check_data_folder() {
    let data_folder = CONFIG.data_folder();
    if let Err(e) = std::fs::create_dir_all(&data_folder) {
        eprintln!("Unable to create the data folder {data_folder}: {e}");
        exit(1);
    }
}

fn create_db_pool() -> DbPool {
    match DbPool::from_config() {
        Ok(pool) => pool,
        Err(e) => {
            error!("Error creating the database pool: {e:#?}");
            exit(1);
        }
    }
}

fn schedule_jobs(pool: DbPool) {
    if CONFIG.job_poll_interval_ms() == 0 {
        info!("Job scheduler disabled.");
        return;
    }

    thread::Builder::new()
        .name("job-scheduler".to_string())
        .spawn(move || {
            use job_scheduler_ng::{Job, JobScheduler};
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let _runtime_guard = runtime.enter();

            let mut sched = JobScheduler::new();

            // Expired interactive flows and refresh tokens past retention
            if !CONFIG.flow_purge_schedule().is_empty() {
                sched.add(Job::new(CONFIG.flow_purge_schedule().parse().unwrap(), || {
                    runtime.spawn(purge_auth_state(pool.clone()));
                }));
            }

            // Unassigned sandboxes past retention, objects included
            if !CONFIG.sandbox_cleanup_schedule().is_empty() {
                sched.add(Job::new(CONFIG.sandbox_cleanup_schedule().parse().unwrap(), || {
                    runtime.spawn(clean_sandboxes(pool.clone()));
                }));
            }

            // Configuration snapshot refresh (soft TTL)
            if !CONFIG.registry_refresh_schedule().is_empty() {
                sched.add(Job::new(CONFIG.registry_refresh_schedule().parse().unwrap(), || {
                    runtime.spawn(registry::refresh_if_stale());
                }));
            }

            loop {
                sched.tick();
                runtime.block_on(tokio::time::sleep(Duration::from_millis(CONFIG.job_poll_interval_ms())));
            }
        })
        .expect("Error spawning job scheduler thread");
}

async fn get_scheduler_connection(pool: &DbPool) -> Option<DbConn> {
    match pool.get().await {
        Ok(conn) => Some(conn),
        Err(e) => {
            warn!("Scheduled job could not get a database connection: {e:#?}");
            None
        }
    }
}

async fn purge_auth_state(pool: DbPool) {
    debug!("Purging expired authentication flows");
    let Some(conn) = get_scheduler_connection(&pool).await else {
        return;
    };
    if let Err(e) = DeviceFlow::purge_expired(CONFIG.device_flow_expiration_seconds(), &conn).await {
        warn!("Error purging device flows: {e:#?}");
    }
    if let Err(e) = AuthorizationFlow::purge_expired(CONFIG.authorization_flow_expiration_seconds(), &conn).await {
        warn!("Error purging authorization flows: {e:#?}");
    }
    if let Err(e) = RefreshToken::purge_expired(CONFIG.refresh_token_retention_days(), &conn).await {
        warn!("Error purging refresh tokens: {e:#?}");
    }
}

async fn clean_sandboxes(pool: DbPool) {
    debug!("Cleaning expired sandboxes");
    let Some(conn) = get_scheduler_connection(&pool).await else {
        return;
    };
    api::clean_sandboxes(&conn).await;
}

async fn launch_rocket(pool: DbPool) -> Result<(), Error> {
    let instance = gridgate::build_rocket(pool).ignite().await?;

    let shutdown = instance.shutdown();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.expect("Error setting Ctrl-C handler");
        info!("Exiting Gridgate!");
        shutdown.notify();
    });

    instance.launch().await?;

    info!("Gridgate process exited!");
    Ok(())
}
