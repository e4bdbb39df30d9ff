use clap::{arg, command, Command};
use std::error::Error;
use std::io::Write;

/// Flags shared by the subcommands that run the pipeline.
fn with_pipeline_args(cmd: Command<'static>) -> Command<'static> {
    cmd.arg(arg!(--source <CRS> "Source reference system, e.g. EPSG:25832").required(false))
        .arg(arg!(--target <CRS> "Destination (geographic) reference system, e.g. EPSG:4326").required(false))
        .arg(arg!(--delimiter <CHAR> "Field delimiter: a character, or tab/comma/semicolon").required(false))
        .arg(arg!(--attribute <INDEX> "Field index of the elevation level attribute").required(false))
        .arg(arg!(--column <INDEX> "Read the geometry from this field instead of searching for it").required(false))
        .arg(arg!(--wells <COLUMNS> "Point features: X,Y,LABEL field indices").required(false))
        .arg(arg!(--batch <COUNT> "Render commands per batch").required(false))
        .arg(arg!(--extension <EXT> "Tile file extension").required(false))
        .arg(arg!(--pacing <MS> "Delay between tiles in milliseconds").required(false))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let matches = command!()
        .propagate_version(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(arg!(-v --verbose ... "Increases verbosity by one level (can be repeated)"))
        .arg(
            arg!(--vmodule <FILTER> "sets the env_logger filter to the given string: \
                                     default,module::path=level,... \
                                     {trace,debug,info,warn,error,none}")
            .required(false),
        )
        .subcommand(Command::new("version").about("Print version information"))
        .subcommand(
            with_pipeline_args(Command::new("render"))
                .about("streams every tile in DIR as addLine/addMarker script commands")
                .arg(arg!([DIR] "Tile directory (default data/tiles)").required(false).allow_invalid_utf8(true))
                .arg(arg!(-o --output <FILE> "Write the script here instead of stdout").required(false).allow_invalid_utf8(true))
                .arg(arg!(--queue <DEPTH> "Bound the batch queue; the worker waits while it is full").required(false)),
        )
        .subcommand(
            with_pipeline_args(Command::new("inspect"))
                .about("prints what the pipeline makes of one tile file")
                .arg(arg!(-a - -all "If set, lists every dropped record."))
                .arg(arg!([TILE]).required(true).allow_invalid_utf8(true)),
        )
        .subcommand(
            Command::new("split")
                .about("splits a large delimited file into tiles with a repeated header")
                .arg(arg!([INPUT]).required(true).allow_invalid_utf8(true))
                .arg(arg!([OUTDIR] "Output directory (default data/tiles)").required(false).allow_invalid_utf8(true))
                .arg(arg!(--records <COUNT> "Records per tile (default 2000)").required(false))
                .arg(arg!(--delimiter <CHAR> "Field delimiter").required(false)),
        )
        .get_matches();

    // Logging stuff: keep above everything but the cmdline parsing.
    let mut log_builder = env_logger::Builder::new();
    match matches.occurrences_of("verbose") {
        0 => {
            log_builder.filter_level(log::LevelFilter::Warn);
        }
        1 => {
            log_builder.filter_level(log::LevelFilter::Info);
        }
        2 => {
            log_builder.filter_level(log::LevelFilter::Debug);
        }
        _ => {
            log_builder.filter_level(log::LevelFilter::Trace);
        }
    };
    if let Some(filter) = matches.value_of("vmodule") {
        log_builder.parse_filters(filter);
    }
    log_builder.init();

    match matches.subcommand() {
        Some(("version", _)) => {
            println!(env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some(("render", sub_matches)) => {
            let mut config = gwtool::pipeline_config(sub_matches)?;
            if let Some(dir) = sub_matches.value_of_os("DIR") {
                config.tile_dir = dir.into();
            }
            let queue = match sub_matches.value_of("queue") {
                Some(depth) => Some(depth.parse::<usize>()?),
                None => None,
            };

            let report = if let Some(out_path) = sub_matches.value_of_os("output") {
                let mut out = std::io::BufWriter::new(std::fs::File::create(out_path)?);
                let report = gwtool::render(config, queue, &mut out).await?;
                println!("Wrote script to {:?}", &out_path);
                report
            } else {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                gwtool::render(config, queue, &mut out).await?
            };
            // The summary goes to stderr so stdout stays a clean script.
            let mut stderr = std::io::stderr();
            writeln!(stderr, "{}", &report)?;
        }
        Some(("inspect", sub_matches)) => {
            let path = sub_matches.value_of_os("TILE").unwrap();
            let config = gwtool::pipeline_config(sub_matches)?;
            let report = gwtool::inspect(&path, config)?;
            if sub_matches.is_present("all") {
                println!("{:+}", &report); // Use {:+} to list every diagnostic.
            } else {
                println!("{}", &report);
            }
        }
        Some(("split", sub_matches)) => {
            let input = sub_matches.value_of_os("INPUT").unwrap();
            let out_dir = sub_matches.value_of_os("OUTDIR").unwrap_or_else(|| "data/tiles".as_ref());
            let mut options = gwlines::SplitOptions::default();
            if let Some(records) = sub_matches.value_of("records") {
                options.records_per_tile = records.parse()?;
            }
            if let Some(delimiter) = sub_matches.value_of("delimiter") {
                options.delimiter = gwtool::parse_delimiter(delimiter)?;
            }
            let tiles = gwlines::split_into_tiles(&input, &out_dir, &options)?;
            println!("Wrote {} tiles to {:?}", tiles.len(), &out_dir);
        }
        _ => unreachable!(),
    }
    Ok(())
}
