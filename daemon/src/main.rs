use clap::{App, Arg};
use crosswire::daemon::{install_signal_handlers, Daemon};
use ingot::config::Config;
use ingot::keys::BindingKey;
use ingot::logging;
use std::fs;
use std::process;

fn main() {
    let matches = App::new("cpcd")
        .version("0.1.0")
        .about("Multiplexes endpoint traffic between host applications and a wireless co-processor.")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to the daemon configuration file")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .help("Generate and store the binding key, then exit"),
        )
        .arg(
            Arg::with_name("unbind")
                .long("unbind")
                .help("Remove the stored binding key, then exit"),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap();
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("cpcd: cannot load configuration {}: {}", config_path, err);
            process::exit(1);
        }
    };

    if matches.is_present("bind") {
        process::exit(run_bind(&config));
    }
    if matches.is_present("unbind") {
        process::exit(run_unbind(&config));
    }

    let log = match logging::build(&config.logging) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("cpcd: {}", err);
            process::exit(1);
        }
    };

    let signal_fd = match install_signal_handlers() {
        Ok(fd) => fd,
        Err(err) => {
            logging::crit!(log, "cannot install signal handlers"; "error" => %err);
            process::exit(1);
        }
    };

    let mut daemon = match Daemon::new(config, Some(signal_fd), log.clone()) {
        Ok(daemon) => daemon,
        Err(err) => {
            // Driver open failures and a missing binding key are fatal.
            logging::crit!(log, "daemon startup failed"; "error" => %err);
            process::exit(1);
        }
    };

    if let Err(err) = daemon.run() {
        logging::crit!(log, "daemon terminated"; "error" => %err);
        process::exit(1);
    }
}

fn run_bind(config: &Config) -> i32 {
    let path = match &config.security.binding_key_file {
        Some(path) => path,
        None => {
            eprintln!("cpcd: no binding_key_file configured");
            return 1;
        }
    };

    if path.exists() {
        eprintln!("cpcd: binding key already present at {}", path.display());
        return 1;
    }

    let key = BindingKey::generate();
    if let Err(err) = key.store(path) {
        eprintln!("cpcd: cannot store binding key: {}", err);
        return 1;
    }

    let id = key.id();
    println!("binding key written to {}", path.display());
    println!(
        "key id: {:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        id[0], id[1], id[2], id[3], id[4], id[5], id[6], id[7]
    );
    0
}

fn run_unbind(config: &Config) -> i32 {
    let path = match &config.security.binding_key_file {
        Some(path) => path,
        None => {
            eprintln!("cpcd: no binding_key_file configured");
            return 1;
        }
    };

    match fs::remove_file(path) {
        Ok(()) => {
            println!("binding key removed from {}", path.display());
            0
        }
        Err(err) => {
            eprintln!("cpcd: cannot remove binding key: {}", err);
            1
        }
    }
}
