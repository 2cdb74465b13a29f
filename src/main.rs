use ble_logger::app::{self, EXIT_ERROR, Options};
use ble_logger::config::Config;
use clap::{CommandFactory, Parser};
use log::info;
use std::panic::{self, PanicHookInfo};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_PANIC: i32 = 2;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook so supervisors see a distinct exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    let config = match Config::try_from(options) {
        Ok(config) => config,
        Err(why) => {
            eprintln!("error: {}", why);
            let _ = Options::command().write_help(&mut std::io::stderr());
            std::process::exit(EXIT_ERROR);
        }
    };

    let mut stdout = std::io::stdout();
    tokio::select! {
        result = app::run(config, &mut stdout) => match result {
            Ok(()) => std::process::exit(EXIT_SUCCESS),
            Err(why) => {
                eprintln!("error: {}", why);
                std::process::exit(why.exit_code());
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C pressed, stopping");
            println!("Ctrl+C pressed");
            std::process::exit(EXIT_SUCCESS);
        }
    }
}
