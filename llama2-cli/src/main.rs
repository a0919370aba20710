use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use llama2_inference::{DeviceType, RuntimeConfig, run_forward};
use log::info;

fn cli() -> Command {
    Command::new("llama2")
        .about("llama2 embedding runtime in Rust")
        .arg(
            Arg::new("checkpoint")
                .help("Model checkpoint file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("tokenizer")
                .short('k')
                .long("tokenizer")
                .value_name("PATH")
                .help("Tokenizer vocabulary file")
                .required(true),
        )
        .arg(
            Arg::new("prompt")
                .short('i')
                .long("prompt")
                .value_name("STRING")
                .help("Input prompt to embed"),
        )
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("STRING")
                .help("Execution device: host|accelerator [default: host]")
                .default_value("host"),
        )
}

fn parse_device(matches: &ArgMatches) -> Result<DeviceType> {
    match matches
        .get_one::<String>("device")
        .map(String::as_str)
        .unwrap_or("host")
    {
        "host" => Ok(DeviceType::Host),
        "accelerator" => Ok(DeviceType::Accelerator),
        other => anyhow::bail!("unknown device: {other}"),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let matches = cli().get_matches();
    let device = parse_device(&matches)?;

    let config = RuntimeConfig::builder()
        .model_path(matches.get_one::<String>("checkpoint"))
        .tokenizer_path(matches.get_one::<String>("tokenizer"))
        .device(Some(device))
        .prompt(matches.get_one::<String>("prompt"))
        .build()
        .map_err(|msg| anyhow::anyhow!(msg))?;

    let output = run_forward(config).context("embedding run failed")?;

    info!(
        "embedded {} tokens into {}-dimensional rows",
        output.tokens.len(),
        output.dim
    );

    for (row_idx, token) in output.tokens.iter().enumerate() {
        let row = &output.embeddings[row_idx * output.dim..(row_idx + 1) * output.dim];
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        let preview: Vec<f32> = row.iter().take(4).copied().collect();
        println!("token {token:>6}  norm {norm:>10.4}  {preview:?}");
    }

    Ok(())
}
