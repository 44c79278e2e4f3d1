//! Command implementations

use anyhow::{Context, Result};
use colored::Colorize;
use qdq_fold::config::Config;
use qdq_fold::folding::{convert_to_deployable_onnx_with, find_fold_sites, Conversion};
use qdq_fold::onnx_utils::{OnnxModel, SaveLayout, SaveOptions};
use std::error::Error;
use std::path::Path;

fn print_conversion(conversion: &Conversion) {
    let report = &conversion.report;
    println!("✓ Folded {} weight(s), {} bias(es)", report.folded_weights, report.folded_biases);
    println!(
        "  Removed:          {} node(s), {} initializer(s)",
        report.removed_nodes, report.removed_constants
    );
    match &conversion.layout {
        SaveLayout::SingleFile => println!("  Layout:           single file"),
        SaveLayout::ExternalData { data_path, tensors } => println!(
            "  Layout:           external data ({} tensor(s) in {})",
            tensors,
            data_path.display()
        ),
    }
    if !report.warnings.is_empty() {
        let clipped = format!(
            "⚠️  {} parameter(s) clipped during quantization",
            report.warnings.len()
        );
        println!("{}", clipped.yellow());
        for warning in &report.warnings {
            println!("    - {}", warning);
        }
    }
    if report.is_noop() {
        println!("{}", "  No constant QDQ chains found; model rewritten unchanged".dimmed());
    }
}

fn print_failure(input: &str, err: &qdq_fold::FoldError) {
    println!("{} {}", "✗".red(), input.bold());
    println!("  {}", err.to_string().red());
    let mut cause = err.source();
    while let Some(c) = cause {
        println!("    caused by: {}", c);
        cause = c.source();
    }
}

fn convert_one(input: &str, options: &SaveOptions) -> Result<Conversion> {
    println!("📦 Converting: {}", input.bold());
    match convert_to_deployable_onnx_with(input, options) {
        Ok(conversion) => {
            print_conversion(&conversion);
            println!();
            Ok(conversion)
        }
        Err(err) => {
            print_failure(input, &err);
            println!();
            Err(err.into())
        }
    }
}

pub fn convert(input: &str) -> Result<()> {
    convert_one(input, &SaveOptions::default())?;
    println!("{}", "Done".green().bold());
    Ok(())
}

fn run_many(inputs: &[String], options: &SaveOptions, continue_on_error: bool) -> Result<()> {
    let mut failed = Vec::new();

    for (idx, input) in inputs.iter().enumerate() {
        println!("[{}/{}]", idx + 1, inputs.len());
        if let Err(err) = convert_one(input, options) {
            if !continue_on_error {
                return Err(err);
            }
            failed.push(input.as_str());
        }
    }

    println!("📊 Summary:");
    println!("  Converted:  {}", (inputs.len() - failed.len()).to_string().green());
    if failed.is_empty() {
        return Ok(());
    }

    println!("  Failed:     {}", failed.len().to_string().red());
    for input in &failed {
        println!("    - {}", input);
    }
    anyhow::bail!("{} of {} model(s) failed to convert", failed.len(), inputs.len())
}

pub fn batch(inputs: &[String], continue_on_error: bool) -> Result<()> {
    println!("📂 Batch conversion of {} model(s)", inputs.len());
    println!();
    run_many(inputs, &SaveOptions::default(), continue_on_error)
}

pub fn info(input: &str) -> Result<()> {
    println!("📊 Model Information: {}", input.bold());
    println!();

    let model = OnnxModel::load(input)?;
    let info = model.info();

    println!("  Name:          {}", info.name.cyan());
    println!("  Producer:      {}", info.producer);
    println!("  IR version:    {}", info.ir_version);
    println!("  Opset:         {}", info.opset);
    println!("  Nodes:         {}", info.num_nodes);
    println!("  Initializers:  {}", info.num_initializers);
    println!("  Foldable:      {}", info.foldable_sites);
    println!();

    println!("  Inputs ({}):", info.inputs.len());
    for input in &info.inputs {
        println!("    - {}", input);
    }
    println!();

    println!("  Outputs ({}):", info.outputs.len());
    for output in &info.outputs {
        println!("    - {}", output);
    }

    Ok(())
}

pub fn check(input: &str) -> Result<()> {
    println!("🔍 Checking: {}", input.bold());
    println!();

    let model = OnnxModel::load(input)?;
    let report = model.validate_connectivity();
    print!("{}", report.summary());

    let graph = model.graph().context("Failed to lift model graph")?;
    let sites = find_fold_sites(&graph);
    if sites.is_empty() {
        println!("  Constant QDQ chains: none");
    } else {
        println!("  Constant QDQ chains: {}", sites.len().to_string().yellow());
        for site in &sites {
            let consumer = &graph.nodes[site.consumer];
            println!(
                "    - {} → {} '{}' (input {})",
                site.source,
                consumer.op.as_str(),
                consumer.name,
                site.slot
            );
        }
    }
    println!();

    if !report.valid {
        anyhow::bail!("graph connectivity check failed");
    }
    println!("{}", "✓ Model OK".green());
    Ok(())
}

pub fn run_config(config_file: &str, dry_run: bool) -> Result<()> {
    println!("⚙️  Loading config: {}", config_file.bold());
    let config = Config::from_file(config_file)?;
    config.validate()?;
    let options = config.save_options();

    println!("  Models:             {}", config.models.len());
    println!("  Continue on error:  {}", config.continue_on_error);
    println!("  External data file: {}", options.external_data_file);
    println!("  External threshold: {} bytes", options.external_threshold);
    println!();

    if dry_run {
        for model in &config.models {
            let status = if Path::new(model).exists() {
                "found".green()
            } else {
                "missing".red()
            };
            println!("  - {} ({})", model, status);
        }
        println!();
        println!("{}", "Dry run: nothing written".yellow());
        return Ok(());
    }

    run_many(&config.models, &options, config.continue_on_error)
}
