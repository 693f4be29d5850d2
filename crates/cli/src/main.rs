use std::fs::File;
use std::io::{BufReader, BufWriter};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use lmefit_core::bootstrap::{parametric_bootstrap, BootstrapOptions, BootstrapResult};
use lmefit_core::data::DataFrame;
use lmefit_core::glmm::{Family, GeneralizedLinearMixedModel};
use lmefit_core::lmm::{FitOptions, FitResult, LinearMixedModel};
use lmefit_core::model::{ModelBuilder, ModelMatrices, RandomSpec};
use lmefit_core::MixedModelFit;

#[derive(Parser)]
#[command(name = "lmefit")]
#[command(version)]
#[command(about = "Fit linear and generalized linear mixed models by profiled likelihood")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a mixed model
    Fit {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        fit: FitArgs,

        /// Write the optimizer summary to this JSON file
        #[arg(long)]
        save_optsum: Option<String>,

        /// Print the block storage chosen for the factor
        #[arg(long)]
        fill_in: bool,

        /// Output format: "text" (default) or "json"
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Parametric bootstrap of a fitted model
    Bootstrap {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        fit: FitArgs,

        /// Number of bootstrap samples
        #[arg(short = 'n', long, default_value = "100")]
        samples: usize,

        /// Seed for the per-sample random streams
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Worker threads (default: all cores)
        #[arg(long)]
        threads: Option<usize>,

        /// Memory budget for concurrent refits, in MiB
        #[arg(long, default_value = "2048")]
        memory_mib: usize,

        /// Coverage of the reported intervals
        #[arg(long, default_value = "0.95")]
        level: f64,

        /// Write the per-sample table here; ".json" selects JSON, CSV otherwise
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Rebuild a fit from a saved optimizer summary and verify it
    Restore {
        #[command(flatten)]
        model: ModelArgs,

        /// Optimizer summary written by `fit --save-optsum`
        #[arg(long)]
        optsum: String,

        /// Response family, as for `fit`
        #[arg(long)]
        family: Option<String>,

        /// Output format: "text" (default) or "json"
        #[arg(long, default_value = "text")]
        format: String,
    },
}

/// Columns that make up the model matrices.
#[derive(Args)]
struct ModelArgs {
    /// Path to data CSV file
    #[arg(short, long)]
    data: String,

    /// Response column
    #[arg(short, long)]
    response: String,

    /// Numeric fixed-effect covariates (repeatable)
    #[arg(short, long)]
    fixed: Vec<String>,

    /// Omit the fixed intercept
    #[arg(long)]
    no_intercept: bool,

    /// Random terms: GROUP, GROUP|SLOPE,... or GROUP||SLOPE,... (repeatable)
    #[arg(long, required = true)]
    random: Vec<String>,

    /// Prior weights column (trials for binomial responses)
    #[arg(long)]
    weights: Option<String>,

    /// Offset column
    #[arg(long)]
    offset: Option<String>,
}

#[derive(Args)]
struct FitArgs {
    /// Response family, e.g. "bernoulli", "poisson", "binomial:probit"
    #[arg(long)]
    family: Option<String>,

    /// Use the REML criterion (linear models)
    #[arg(long)]
    reml: bool,

    /// Optimize θ only for generalized models
    #[arg(long)]
    fast: bool,

    /// Adaptive Gauss-Hermite points for generalized models (odd)
    #[arg(long, default_value = "1")]
    nagq: usize,

    /// Maximum number of objective evaluations
    #[arg(long, default_value = "10000")]
    max_feval: usize,

    /// Relative objective tolerance
    #[arg(long, default_value = "1e-12")]
    ftol_rel: f64,

    /// Absolute parameter tolerance
    #[arg(long, default_value = "1e-6")]
    xtol_abs: f64,

    /// Keep every k-th evaluation in the trace
    #[arg(long, default_value = "1")]
    thin: usize,
}

impl FitArgs {
    fn options(&self) -> FitOptions {
        FitOptions::default()
            .reml(self.reml)
            .fast(self.fast)
            .nagq(self.nagq)
            .max_feval(self.max_feval)
            .ftol_rel(self.ftol_rel)
            .xtol_abs(self.xtol_abs)
            .thin(self.thin)
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Fit {
            model,
            fit,
            save_optsum,
            fill_in,
            format,
        } => cmd_fit(&model, &fit, save_optsum.as_deref(), fill_in, &format),
        Commands::Bootstrap {
            model,
            fit,
            samples,
            seed,
            threads,
            memory_mib,
            level,
            output,
        } => {
            let mut options = BootstrapOptions::default()
                .memory_budget(memory_mib << 20)
                .level(level);
            options.threads = threads;
            cmd_bootstrap(&model, &fit, samples, seed, &options, output.as_deref())
        }
        Commands::Restore {
            model,
            optsum,
            family,
            format,
        } => cmd_restore(&model, family.as_deref(), &optsum, &format),
    }
}

fn parse_family(family: Option<&str>) -> Result<Option<Family>> {
    family
        .map(|f| {
            f.parse::<Family>()
                .with_context(|| format!("Invalid family '{}'", f))
        })
        .transpose()
}

fn build_matrices(args: &ModelArgs) -> Result<ModelMatrices> {
    let df = DataFrame::from_csv(&args.data)
        .with_context(|| format!("Failed to load data from '{}'", args.data))?;
    eprintln!(
        "Loaded {} observations, {} columns from '{}'",
        df.nrows(),
        df.ncols(),
        args.data
    );

    let mut builder = ModelBuilder::new()
        .data(&df)
        .response(&args.response)
        .intercept(!args.no_intercept);
    for col in &args.fixed {
        builder = builder.fixed(col);
    }
    for term in &args.random {
        let spec: RandomSpec = term
            .parse()
            .with_context(|| format!("Invalid random term '{}'", term))?;
        builder = builder.random(spec);
    }
    if let Some(w) = &args.weights {
        builder = builder.weights(w);
    }
    if let Some(o) = &args.offset {
        builder = builder.offset(o);
    }
    builder.build().context("Failed to build model matrices")
}

fn cmd_fit(
    args: &ModelArgs,
    fit_args: &FitArgs,
    save_optsum: Option<&str>,
    fill_in: bool,
    output_format: &str,
) -> Result<()> {
    let matrices = build_matrices(args)?;
    let family = parse_family(fit_args.family.as_deref())?;
    let fitted = lmefit_core::fit(matrices, family, &fit_args.options()).context("Model fitting failed")?;

    if fill_in {
        let report = match &fitted {
            MixedModelFit::Linear { model, .. } => model.fill_in_report(),
            MixedModelFit::Generalized { model, .. } => model.linear_model().fill_in_report(),
        };
        eprintln!("{}", report);
    }
    if let Some(path) = save_optsum {
        let file = File::create(path).with_context(|| format!("Failed to create '{}'", path))?;
        fitted
            .save_optsum(BufWriter::new(file))
            .context("Failed to write optimizer summary")?;
        eprintln!("Optimizer summary written to '{}'", path);
    }
    print_result(fitted.result(), output_format)
}

fn cmd_bootstrap(
    args: &ModelArgs,
    fit_args: &FitArgs,
    samples: usize,
    seed: u64,
    options: &BootstrapOptions,
    output: Option<&str>,
) -> Result<()> {
    let matrices = build_matrices(args)?;
    let family = parse_family(fit_args.family.as_deref())?;
    let fitted = lmefit_core::fit(matrices, family, &fit_args.options()).context("Model fitting failed")?;

    let result = match &fitted {
        MixedModelFit::Linear { model, .. } => parametric_bootstrap(model, samples, seed, options),
        MixedModelFit::Generalized { model, .. } => {
            parametric_bootstrap(model, samples, seed, options)
        }
    }
    .context("Bootstrap failed")?;

    eprintln!(
        "Bootstrap: {} samples, {} failed, {} threads",
        result.n_samples(),
        result.n_failed(),
        result.threads
    );
    if let Some(path) = output {
        write_table(&result, path)?;
        eprintln!("Bootstrap table written to '{}'", path);
    }

    println!(
        "{:<40} {:>12} {:>12} {:>12} {:>12}",
        "parameter", "mean", "std", "lower", "upper"
    );
    for s in result.summarize(options.level) {
        println!(
            "{:<40} {:>12.6} {:>12.6} {:>12.6} {:>12.6}",
            s.parameter, s.mean, s.std_dev, s.lower, s.upper
        );
    }
    Ok(())
}

fn write_table(result: &BootstrapResult, path: &str) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create '{}'", path))?;
    let writer = BufWriter::new(file);
    let written = if path.ends_with(".json") {
        result.write_json(writer)
    } else {
        result.write_csv(writer)
    };
    written.with_context(|| format!("Failed to write bootstrap table to '{}'", path))
}

fn cmd_restore(
    args: &ModelArgs,
    family: Option<&str>,
    optsum_path: &str,
    output_format: &str,
) -> Result<()> {
    let matrices = build_matrices(args)?;
    let family = parse_family(family)?;
    let file = File::open(optsum_path)
        .with_context(|| format!("Failed to open optimizer summary '{}'", optsum_path))?;
    let reader = BufReader::new(file);

    let result = match family {
        Some(f) if !f.is_linear() => {
            let mut model = GeneralizedLinearMixedModel::new(matrices, f)
                .context("Failed to build generalized model")?;
            model
                .restore_optsum(reader)
                .context("Failed to restore fit")?;
            model.result()?
        }
        _ => {
            let mut model = LinearMixedModel::new(matrices).context("Failed to build linear model")?;
            model
                .restore_optsum(reader)
                .context("Failed to restore fit")?;
            model.result()?
        }
    };
    eprintln!("Restored objective {:.6} verified", result.objective);
    print_result(&result, output_format)
}

fn print_result(result: &FitResult, output_format: &str) -> Result<()> {
    match output_format.to_lowercase().as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(result)?),
        _ => println!("{}", result.summary()),
    }
    Ok(())
}
