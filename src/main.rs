//! Command-line driver: read a distance matrix, assign cluster codes to its
//! samples, and print one `identifier<TAB>code` line per sample.

use std::cmp::Reverse;
use std::fs::File;
use std::io::{self, BufRead as _, BufReader, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use ordered_float::OrderedFloat;

use snp_codes::{ClusterForest, Context, DistanceMatrix, MatrixLayout, SampleKey, Thresholds};

#[derive(Parser)]
#[command(name = "snp-codes")]
#[command(
    about = "Assign hierarchical cluster codes to samples from a distance matrix.",
    long_about = None
)]
struct Args {
    /// Distance matrix file; the first column holds sample identifiers.
    ///
    /// The delimiter follows the extension: comma for .csv, tab for .tsv,
    /// any whitespace otherwise.
    matrix_file: PathBuf,

    /// Which triangle of the matrix is populated.
    #[arg(short = 'm', long = "matrix-type", value_enum)]
    matrix_type: MatrixType,

    /// Comma-separated distance thresholds, e.g. "25,10,5".
    ///
    /// Sorted descending before use; an exact-match level (0) is appended
    /// when absent.
    #[arg(short = 't', long = "thresholds")]
    thresholds: String,

    /// Also print the clustering tree, indented by level.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum MatrixType {
    /// Bottom-left triangle.
    Bl,
    /// Top-right triangle.
    Tr,
}

impl From<MatrixType> for MatrixLayout {
    fn from(kind: MatrixType) -> Self {
        match kind {
            MatrixType::Bl => Self::LowerLeft,
            MatrixType::Tr => Self::UpperRight,
        }
    }
}

/// Parse the matrix file into sample keys (identifier + row index) and the
/// numeric rows. Rows may be ragged for triangular files.
fn read_matrix(path: &Path, layout: MatrixLayout) -> Result<(Vec<SampleKey>, DistanceMatrix)> {
    let delimiter = match path.extension().and_then(|ext| ext.to_str()) {
        Some("csv") => Some(','),
        Some("tsv") => Some('\t'),
        _ => None,
    };
    let file = File::open(path)
        .with_context(|| format!("could not open matrix file {}", path.display()))?;
    let mut samples = Vec::new();
    let mut rows = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line =
            line.with_context(|| format!("could not read matrix file {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = match delimiter {
            Some(delim) => line.split(delim).map(str::trim).collect(),
            None => line.split_whitespace().collect(),
        };
        let (id, values) = fields
            .split_first()
            .with_context(|| format!("line {}: no fields", line_no + 1))?;
        let row = values
            .iter()
            .map(|value| {
                value.parse::<f64>().with_context(|| {
                    format!("line {}: bad distance value {value:?}", line_no + 1)
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        samples.push(SampleKey::new(*id, samples.len()));
        rows.push(row);
    }
    Ok((samples, DistanceMatrix::new(rows, layout)))
}

/// Parse and sort the user's threshold list, highest first.
fn parse_thresholds(spec: &str) -> Result<Thresholds> {
    let mut values = Vec::new();
    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        values.push(
            token
                .parse::<f64>()
                .with_context(|| format!("could not parse threshold {token:?}"))?,
        );
    }
    if values.is_empty() {
        bail!("no thresholds supplied");
    }
    values.sort_unstable_by_key(|&value| Reverse(OrderedFloat(value)));
    Ok(Thresholds::new(values)?)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let thresholds = parse_thresholds(&args.thresholds)?;

    info!("importing matrix values from {}", args.matrix_file.display());
    let (samples, matrix) = read_matrix(&args.matrix_file, args.matrix_type.into())?;
    if samples.is_empty() {
        bail!("matrix file {} contains no samples", args.matrix_file.display());
    }

    let ctx = Context::new(&matrix, &thresholds);
    let mut forest = ClusterForest::new();

    let progress = ProgressBar::new(samples.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{bar:20} {pos}/{len} {msg}")
            .expect("The progress-bar template should be valid."),
    );

    info!("clustering {} samples", samples.len());
    for key in &samples {
        progress.set_message(format!("adding {key}"));
        forest.insert(key, &ctx)?;
        progress.inc(1);
    }
    progress.finish_and_clear();
    info!("clustering finished");

    let mut stdout = io::stdout().lock();
    for key in &samples {
        writeln!(stdout, "{key}\t{}", forest.code_for(key))?;
    }
    if args.verbose {
        write!(stdout, "{}", forest.render())?;
    }
    Ok(())
}
