use clap::{App, Arg};
use ingot::keys::BindingKey;
use std::process;

fn main() {
    let matches = App::new("Binding Key Generator")
        .version("1.0")
        .about("Generates the host's static X25519 binding key file.")
        .arg(
            Arg::with_name("KEY_FILE")
                .help("Where to write the key (created with mode 0600)")
                .required(true),
        )
        .arg(
            Arg::with_name("force")
                .long("force")
                .help("Overwrite an existing key file"),
        )
        .get_matches();

    let path = matches.value_of("KEY_FILE").unwrap();

    if std::path::Path::new(path).exists() && !matches.is_present("force") {
        eprintln!("{} already exists; pass --force to replace it", path);
        process::exit(1);
    }

    let key = BindingKey::generate();
    if let Err(err) = key.store(path) {
        eprintln!("cannot write {}: {}", path, err);
        process::exit(1);
    }

    let id = key.id();
    println!("binding key written to {}", path);
    println!(
        "key id: {:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        id[0], id[1], id[2], id[3], id[4], id[5], id[6], id[7]
    );
}
