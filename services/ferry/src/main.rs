use ballast::logging;
use clap::{App, Arg};
use std::path::Path;
use std::process;
use windlass::client::Client;
use windlass::server::Server;
use windlass::DEFAULT_PORT;

const SERVER_ADDRESS: &str = "127.0.0.1";

fn main() {
    let matches = App::new("ferry")
        .version("0.1.0")
        .about("Delivers a single file to a ferry server over TCP, or runs the receiving server.")
        .arg(
            Arg::with_name("server")
                .short("s")
                .help("Run the receiving server"),
        )
        .arg(
            Arg::with_name("file")
                .short("c")
                .value_name("FILE")
                .takes_value(true)
                .conflicts_with("server")
                .help("Send FILE to the server"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .value_name("PORT")
                .takes_value(true)
                .help("Port the server listens on and the client connects to"),
        )
        .get_matches();

    let log = logging::init();

    let port = matches
        .value_of("port")
        .map(|raw| match raw.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                logging::warn!(log, "invalid port, falling back to the default";
                               "raw" => raw,
                               "default" => DEFAULT_PORT);
                DEFAULT_PORT
            }
        })
        .unwrap_or(DEFAULT_PORT);

    let result = if matches.is_present("server") {
        Server::new(port, &log).start()
    } else if let Some(raw_path) = matches.value_of("file") {
        let path = Path::new(raw_path);

        if !ballast::fs::file_exists(path) {
            logging::error!(log, "file does not exist"; "path" => raw_path);
            process::exit(1);
        }

        Client::new(SERVER_ADDRESS, port, &log).send_file(path)
    } else {
        logging::error!(log, "nothing to do, pass -s or -c <FILE>");
        process::exit(1);
    };

    if let Err(err) = result {
        logging::error!(log, "exiting with failure"; "error" => ?err);
        process::exit(1);
    }
}
