use clap::ArgMatches;
use gwlines::{
    batch_channel, Batch, BatchReceiver, CommandSink, FeatureKind, LiteralStrategy, Orchestrator, PipelineConfig,
    RunReport, Tile, TileReport,
};
use log::{debug, info, warn};
use simple_error::{bail, SimpleError};
use std::error::Error;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Parses a delimiter flag: a name (`tab`, `comma`, `semicolon`) or a single ASCII character.
pub fn parse_delimiter(value: &str) -> Result<u8, Box<dyn Error>> {
    match value {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        "comma" => Ok(b','),
        "semicolon" => Ok(b';'),
        s if s.len() == 1 && s.is_ascii() => Ok(s.as_bytes()[0]),
        _ => bail!("Unsupported delimiter {:?}; use a single character or tab/comma/semicolon", value),
    }
}

/// Parses `--wells X,Y,LABEL` column indices.
pub fn parse_wells(value: &str) -> Result<FeatureKind, Box<dyn Error>> {
    let columns: Vec<&str> = value.split(',').map(str::trim).collect();
    if columns.len() != 3 {
        bail!("Expected three column indices X,Y,LABEL for --wells but got {:?}", value);
    }
    let index = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| SimpleError::new(format!("Invalid column index {:?} in --wells", s)))
    };
    Ok(FeatureKind::Wells {
        x: index(columns[0])?,
        y: index(columns[1])?,
        label: index(columns[2])?,
    })
}

/// Returns the parsed value of a flag, if given.
fn flag<T>(matches: &ArgMatches, name: &str) -> Result<Option<T>, Box<dyn Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match matches.value_of(name) {
        None => Ok(None),
        Some(v) => match v.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => bail!("Invalid value {:?} for --{}: {}", v, name, e),
        },
    }
}

/// Builds the pipeline configuration from the flags shared by `render` and `inspect`.
///
/// Anything not given keeps the PipelineConfig default.
pub fn pipeline_config(matches: &ArgMatches) -> Result<PipelineConfig, Box<dyn Error>> {
    let mut config = PipelineConfig::default();
    if let Some(v) = matches.value_of("source") {
        config.source_crs = v.to_string();
    }
    if let Some(v) = matches.value_of("target") {
        config.target_crs = v.to_string();
    }
    if let Some(v) = matches.value_of("extension") {
        config.extension = v.trim_start_matches('.').to_string();
    }
    if let Some(v) = flag::<usize>(matches, "batch")? {
        config.batch_size = v;
    }
    if let Some(ms) = flag::<u64>(matches, "pacing")? {
        config.pacing = Duration::from_millis(ms);
    }
    if let Some(v) = flag::<usize>(matches, "attribute")? {
        config.attribute_column = v;
    }
    if let Some(v) = matches.value_of("delimiter") {
        config.delimiter = parse_delimiter(v)?;
    }
    if let Some(v) = flag::<usize>(matches, "column")? {
        config.literal = LiteralStrategy::Column(v);
    }
    if let Some(v) = matches.value_of("wells") {
        config.features = parse_wells(v)?;
    }
    config.validate()?;
    Ok(config)
}

/// First line of every generated script.
pub fn script_header() -> String {
    format!(
        "// gwtool {} render, generated {}",
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().to_rfc3339()
    )
}

/// Writes the header and then every batch as it arrives. Returns the number of batches.
async fn write_script<W: Write>(batches: &mut BatchReceiver, out: &mut W) -> io::Result<usize> {
    writeln!(out, "{}", script_header())?;
    let mut delivered = 0;
    while let Some(batch) = batches.recv().await {
        write!(out, "{}", &batch)?;
        delivered += 1;
    }
    out.flush()?;
    Ok(delivered)
}

/// Runs the whole pipeline and writes the consumer command stream to `out`.
///
/// The orchestrator runs on a blocking worker thread and hands batches over a channel; this
/// task plays the consumer and writes each batch as it arrives. `queue_depth` of None keeps
/// the channel unbounded and relies on pacing; Some(n) blocks the worker while n batches
/// are waiting.
///
/// If writing fails the worker still runs to completion (discarding its batches) before the
/// error is returned.
pub async fn render<W: Write>(
    config: PipelineConfig,
    queue_depth: Option<usize>,
    out: &mut W,
) -> Result<RunReport, Box<dyn Error>> {
    config.validate()?;
    let reprojector = Arc::new(config.reprojector()?);
    info!("Reprojecting {}", &reprojector);

    let (sink, mut batches) = batch_channel(queue_depth);
    let orchestrator = Orchestrator::new(config, reprojector);
    info!("Rendering tiles from {}", orchestrator.config().tile_dir.display());
    let worker = tokio::task::spawn_blocking(move || {
        let mut sink = sink;
        orchestrator.run(&mut sink)
    });

    let written = write_script(&mut batches, out).await;
    // With the receiver gone the worker drops whatever it still produces.
    drop(batches);
    let report = worker.await?;
    match written {
        Ok(delivered) => {
            debug!("Consumer wrote {} batches.", delivered);
            Ok(report)
        }
        Err(e) => {
            warn!("Script output failed; run ended as: {}", &report);
            Err(e.into())
        }
    }
}

/// Swallows batches; the tile report already counts what went through.
struct NullSink;

impl CommandSink for NullSink {
    fn deliver(&mut self, _: Batch) {}
}

/// Runs a single tile file through the pipeline and reports what happened to it.
pub fn inspect<P: AsRef<Path>>(path: P, config: PipelineConfig) -> Result<TileReport, Box<dyn Error>> {
    config.validate()?;
    let reprojector = Arc::new(config.reprojector()?);
    let orchestrator = Orchestrator::new(config, reprojector);
    let tile = Tile::new(0, PathBuf::from(path.as_ref()));
    Ok(orchestrator.process_tile(&tile, &mut NullSink))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiters() {
        assert_eq!(parse_delimiter(";").unwrap(), b';');
        assert_eq!(parse_delimiter(",").unwrap(), b',');
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter("\\t").unwrap(), b'\t');
        assert_eq!(parse_delimiter("semicolon").unwrap(), b';');
        assert!(parse_delimiter(";;").is_err());
        assert!(parse_delimiter("é").is_err());
    }

    #[test]
    fn wells() {
        assert_eq!(parse_wells("2, 3,0").unwrap(), FeatureKind::Wells { x: 2, y: 3, label: 0 });
        assert!(parse_wells("2,3").is_err());
        assert!(parse_wells("a,b,c").is_err());
    }
}
