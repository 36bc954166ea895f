use gdrivesyncd::daemon::{DaemonConfig, DaemonRuntime};
use tokio_util::sync::CancellationToken;

const EXIT_OK: i32 = 0;
const EXIT_FAULT: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_UNSUPPORTED_MODE: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Console,
    Service,
    Help,
}

fn parse_cli_mode<I>(args: I) -> Result<CliMode, String>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Console;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "/console" | "--console" => mode = CliMode::Console,
            "/service" | "--service" => mode = CliMode::Service,
            "--help" | "-h" | "/?" => mode = CliMode::Help,
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(mode)
}

fn print_usage() {
    println!("Usage: gdrivesyncd [/console | /service]");
    println!("  /console   Run in the foreground until enter is pressed (default)");
    println!("  /service   Run under the Windows service manager");
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let mode = match parse_cli_mode(std::env::args()) {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("[gdrivesyncd] {err}");
            print_usage();
            std::process::exit(EXIT_USAGE);
        }
    };

    match mode {
        CliMode::Help => {
            print_usage();
            std::process::exit(EXIT_OK);
        }
        CliMode::Service => {
            eprintln!("[gdrivesyncd] /service requires the Windows service manager and is unsupported on this platform");
            std::process::exit(EXIT_UNSUPPORTED_MODE);
        }
        CliMode::Console => {
            std::process::exit(run_console().await);
        }
    }
}

async fn run_console() -> i32 {
    let config = match DaemonConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("[gdrivesyncd] configuration error: {err:#}");
            return EXIT_FAULT;
        }
    };

    let runtime = match DaemonRuntime::bootstrap(config).await {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("[gdrivesyncd] startup failed: {err:#}");
            return EXIT_FAULT;
        }
    };

    // Console mode runs until enter is pressed.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            shutdown.cancel();
        });
    }
    eprintln!("[gdrivesyncd] console mode, press enter to stop");

    match runtime.run(shutdown).await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            eprintln!("[gdrivesyncd] unhandled fault: {err:#}");
            EXIT_FAULT
        }
    }
}
