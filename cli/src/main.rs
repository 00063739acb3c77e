#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Arg, ArgMatches, Command, crate_version};
use tract_convert::prelude::*;
use tract_convert::zoo::ZOO_URL_ENV;

type CliResult<T> = anyhow::Result<T>;

fn main() {
    let app = Command::new("tract-convert")
        .version(crate_version!())
        .about("Converts a pretrained zoo classifier from ONNX to a frozen TensorFlow graph")
        .arg(
            Arg::new("model")
                .long("model")
                .takes_value(true)
                .help("Zoo model name [default: sqnxt23v5_w2]"),
        )
        .arg(
            Arg::new("size")
                .long("size")
                .takes_value(true)
                .help("Input image size, defaults to the model's"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .takes_value(true)
                .help("Output file name [default: saved_model.pb]"),
        )
        .arg(
            Arg::new("output_dir")
                .long("output-dir")
                .takes_value(true)
                .help("Output directory [default: .]"),
        )
        .arg(
            Arg::new("model_path")
                .long("model-path")
                .takes_value(true)
                .help("Read the ONNX model from this file instead of the zoo"),
        )
        .arg(
            Arg::new("zoo_dir")
                .long("zoo-dir")
                .takes_value(true)
                .help("Model cache directory (or $TRACT_CONVERT_ZOO)"),
        )
        .arg(
            Arg::new("zoo_url")
                .long("zoo-url")
                .takes_value(true)
                .help("Base URL to download missing models from (or $TRACT_CONVERT_ZOO_URL)"),
        )
        .arg(Arg::new("seed").long("seed").takes_value(true).help("Seed the random input"))
        .arg(Arg::new("keep_names").long("keep-names").help("Name layers after the ONNX nodes"))
        .arg(
            Arg::new("keep_var")
                .long("keep-var")
                .takes_value(true)
                .multiple_occurrences(true)
                .help("Variable to leave unfrozen (repeatable)"),
        )
        .arg(
            Arg::new("keep_devices")
                .long("keep-devices")
                .help("Keep device placements in the frozen graph"),
        )
        .arg(Arg::new("as_text").long("as-text").help("Write the graph in protobuf text format"))
        .arg(
            Arg::new("verify")
                .long("verify")
                .help("Reload the written graph and check it against the converted model"),
        )
        .arg(Arg::new("quiet").short('q').long("quiet").help("Do not log every converted layer"))
        .arg(
            Arg::new("verbosity")
                .short('v')
                .multiple_occurrences(true)
                .help("Sets the level of verbosity."),
        );

    let matches = app.get_matches();

    let level = match matches.occurrences_of("verbosity") {
        0 => "warn,tract_convert=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filters = std::env::var("TRACT_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| level.to_string());
    env_logger::Builder::new().parse_filters(&filters).format_timestamp_nanos().init();

    if let Err(e) = handle(&matches) {
        error!("{:?}", e);
        process::exit(1)
    }
}

fn parse<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> CliResult<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    matches
        .value_of(name)
        .map(|s| {
            s.parse::<T>()
                .with_context(|| format!("Invalid value for --{}: {}", name.replace('_', "-"), s))
        })
        .transpose()
}

fn config(matches: &ArgMatches) -> CliResult<PipelineConfig> {
    let default = PipelineConfig::default();
    let model = matches.value_of("model").map(|s| s.to_string()).unwrap_or(default.model);
    let size = match parse::<usize>(matches, "size")? {
        Some(size) => size,
        None => tract_convert::zoo::entry(&model).map(|e| e.input_size).unwrap_or(default.size),
    };
    let name_policy =
        if matches.is_present("keep_names") { NamePolicy::Keep } else { NamePolicy::Renumerate };
    let keep_var_names = matches
        .values_of("keep_var")
        .map(|v| v.map(|s| s.to_string()).collect())
        .unwrap_or_default();
    Ok(PipelineConfig {
        model,
        size,
        output_dir: matches.value_of("output_dir").map(PathBuf::from).unwrap_or(default.output_dir),
        output_file: matches
            .value_of("output")
            .map(|s| s.to_string())
            .unwrap_or(default.output_file),
        seed: parse(matches, "seed")?,
        name_policy,
        verbose: !matches.is_present("quiet"),
        as_text: matches.is_present("as_text"),
        keep_var_names,
        clear_devices: !matches.is_present("keep_devices"),
        verify: matches.is_present("verify"),
        model_path: matches.value_of("model_path").map(PathBuf::from),
    })
}

fn zoo(matches: &ArgMatches) -> CliResult<ModelZoo> {
    let zoo = match matches.value_of("zoo_dir") {
        Some(dir) => {
            let zoo = ModelZoo::new(dir);
            match std::env::var(ZOO_URL_ENV) {
                Ok(url) if !url.is_empty() => zoo.with_base_url(url),
                _ => zoo,
            }
        }
        None => ModelZoo::from_env()?,
    };
    Ok(match matches.value_of("zoo_url") {
        Some(url) => zoo.with_base_url(url),
        None => zoo,
    })
}

fn handle(matches: &ArgMatches) -> CliResult<()> {
    let config = config(matches)?;
    debug!("{:?}", config);
    let zoo = zoo(matches)?;
    let report = Pipeline::new(config).run(&zoo)?;
    print!("{}", report.console());
    if let Some(verified) = report.verified {
        info!("Reloaded {}, max absolute difference: {}", report.path.display(), verified.max_abs);
    }
    Ok(())
}
