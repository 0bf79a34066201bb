use clap::Parser;

/// Extraction and reconciliation of Form 20 booth-level results.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path, optional) A batch configuration file in JSON format, describing all the units to process.
    /// See the manual of the booth_reconcile crate for the format.
    #[clap(short, long, value_parser)]
    pub config: Option<String>,

    /// (file path) A reference record in JSON format. If provided, form20 will check that the record
    /// produced for the unit matches the reference.
    #[clap(short, long, value_parser)]
    pub reference: Option<String>,

    /// (directory path, 'stdout' or empty) Where the records are written. Setting this option overrides
    /// the directory that may be specified with the --config option.
    #[clap(short, long, value_parser)]
    pub out: Option<String>,

    /// (file path) The rows of a single document. Ignored when --config is given.
    #[clap(short, long, value_parser)]
    pub input: Option<String>,

    /// (default json) The type of the input: json, csv or xlsx.
    #[clap(long, value_parser)]
    pub input_type: Option<String>,

    /// (file path) The authoritative candidates of the unit, in JSON format.
    #[clap(long, value_parser)]
    pub candidates: Option<String>,

    /// The identifier of the unit. Defaults to the name of the input file.
    #[clap(long, value_parser)]
    pub unit_id: Option<String>,

    /// The number of booths of the unit, if known.
    #[clap(long, value_parser)]
    pub expected_booths: Option<usize>,

    /// (default strict) The acceptance policy: strict, lenient or degraded.
    #[clap(long, value_parser)]
    pub policy: Option<String>,

    /// The number of units processed in parallel.
    #[clap(long, value_parser)]
    pub workers: Option<usize>,

    /// When using an Excel file, indicates the name of the worksheet to use.
    #[clap(long, value_parser)]
    pub excel_worksheet_name: Option<String>,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
