use clap::{Arg, ArgAction, Command, crate_version};
use log::LevelFilter;
use stripefs::NodeServer;

fn main() {
    let matches = Command::new("stripefs-node")
        .version(crate_version!())
        .about("Storage node server for the stripefs distributed file store")
        .arg(
            Arg::new("port")
                .value_name("PORT")
                .required(true)
                .value_parser(clap::value_parser!(u16))
                .help("TCP port to listen on, on all interfaces"),
        )
        .arg(
            Arg::new("storage-dir")
                .value_name("STORAGE_DIR")
                .required(true)
                .help("Directory holding fragment files; created if missing"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .get_matches();

    let log_level = match matches.get_count("v") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format_timestamp_nanos()
        .filter_level(log_level)
        .init();

    let port = *matches.get_one::<u16>("port").unwrap();
    let storage_dir = matches.get_one::<String>("storage-dir").unwrap();

    let server = match NodeServer::bind(port, storage_dir) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("stripefs-node: cannot serve port {port} from {storage_dir}: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = server.run() {
        eprintln!("stripefs-node: {err}");
        std::process::exit(1);
    }
}
