use heimdall::leadership::LeaderJury;
use heimdall::monitor::{Action, NodeMonitor};
use heimdall::schedule::{ScheduleStore, ScheduleWatchdog};
use heimdall::settings::{CommandLine, Settings};
use heimdall::utils::task::Services;

use std::process::exit;
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() {
    let command_line = CommandLine::load();
    let settings = match Settings::load(&command_line) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("could not load the configuration: {}", err);
            exit(1);
        }
    };
    let _log_guard = match settings.log_settings.init() {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("could not initialise logging: {}", err);
            exit(1);
        }
    };
    if settings.nodes.is_empty() {
        println!("No passive/leader-candidate peers specified. Nothing to do.");
        exit(0);
    }
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("could not start the runtime: {}", err);
            exit(1);
        }
    };
    exit(runtime.block_on(start(settings)));
}

async fn start(settings: Settings) -> i32 {
    let db = match sled::open(&settings.storage) {
        Ok(db) => db,
        Err(err) => {
            error!("could not open the storage at {:?}: {}", settings.storage, err);
            return 1;
        }
    };
    let store = match ScheduleStore::open(&db) {
        Ok(store) => store,
        Err(err) => {
            error!("could not open the schedule store: {}", err);
            return 1;
        }
    };

    let watchdog = Arc::new(ScheduleWatchdog::new(
        settings.nodes.clone(),
        settings.time_settings.clone(),
        store,
    ));

    let mut actions = vec![Action::ShutDownOnBlockLag, Action::ShutDownWhenStuck];
    if let Some(mailer) = &settings.mailer {
        actions.push(Action::EmailOnBlockLag(mailer.clone()));
        actions.push(Action::EmailOnStuck(mailer.clone()));
    }
    let monitor = Arc::new(NodeMonitor::new(
        settings.nodes.clone(),
        settings.monitor.clone(),
        settings.time_settings.clone(),
        watchdog.clone(),
        actions,
    ));

    let mut services = Services::new();
    {
        let watchdog = watchdog.clone();
        services.spawn_future("schedule", move || watchdog.watch());
    }
    if let Some(setup) = settings.jury {
        match LeaderJury::new(
            settings.nodes.clone(),
            watchdog.clone(),
            setup.cert,
            setup.settings,
        ) {
            Ok(jury) => {
                let jury = Arc::new(jury);
                let stats = monitor.subscribe();
                let schedules = watchdog.subscribe();
                {
                    let jury = jury.clone();
                    services.spawn_future("leader_jury", move || jury.judge(stats));
                }
                {
                    let jury = jury.clone();
                    services.spawn_future("sanity", move || jury.sanity_loop(schedules));
                }
                services.spawn_future("turnover", move || jury.turnover_loop());
            }
            Err(err) => warn!("{}", err),
        }
    } else {
        info!("no leader jury configured, supervising node health only");
    }
    {
        let monitor = monitor.clone();
        services.spawn_future("monitor", move || monitor.watch());
    }

    match services.wait_any_finished().await {
        Some(name) => {
            error!("service '{}' terminated unexpectedly", name);
        }
        None => {
            error!("all services vanished without reporting back");
        }
    }
    1
}
