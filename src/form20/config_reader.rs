use crate::form20::*;

use serde::{Deserialize, Serialize};

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub struct OutputSettings {
    #[serde(rename = "outputDirectory")]
    pub output_directory: Option<String>,
    #[serde(rename = "writeDiagnostics")]
    pub write_diagnostics: Option<bool>,
}

/// One administrative unit of the batch.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct UnitSource {
    #[serde(rename = "unitId")]
    pub unit_id: String,
    pub provider: Option<String>,
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(rename = "candidatesPath")]
    pub candidates_path: String,
    #[serde(rename = "expectedBooths")]
    pub expected_booths: Option<usize>,
    pub policy: Option<String>,
    #[serde(rename = "excelWorksheetName")]
    pub excel_worksheet_name: Option<String>,
    #[serde(rename = "referencePath")]
    pub reference_path: Option<String>,
}

/// Overrides of the default extraction rules. Missing values keep their defaults.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize, Default)]
pub struct RulesOverrides {
    #[serde(rename = "boothIdRange")]
    pub booth_id_range: Option<(u32, u32)>,
    #[serde(rename = "voteSumBand")]
    pub vote_sum_band: Option<(u64, u64)>,
    #[serde(rename = "absTolerance")]
    pub abs_tolerance: Option<u64>,
    #[serde(rename = "relTolerance")]
    pub rel_tolerance: Option<f64>,
    #[serde(rename = "minRowCoverage")]
    pub min_row_coverage: Option<f64>,
    #[serde(rename = "layouts")]
    pub layouts: Option<Vec<String>>,
    #[serde(rename = "strictThreshold")]
    pub strict_threshold: Option<f64>,
    #[serde(rename = "looseThreshold")]
    pub loose_threshold: Option<f64>,
    #[serde(rename = "materialityFloor")]
    pub materiality_floor: Option<u64>,
    #[serde(rename = "minCoverage")]
    pub min_coverage: Option<f64>,
    #[serde(rename = "maxMeanError")]
    pub max_mean_error: Option<f64>,
    #[serde(rename = "topN")]
    pub top_n: Option<usize>,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct SegmentSource {
    #[serde(rename = "unitId")]
    pub unit_id: String,
    #[serde(rename = "knownTotals")]
    pub known_totals: Option<Vec<u64>>,
}

/// The postal votes of a parent unit, to be split over units of the batch.
#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ApportionmentSource {
    #[serde(rename = "parentUnitId")]
    pub parent_unit_id: String,
    #[serde(rename = "candidatesPath")]
    pub candidates_path: String,
    pub segments: Vec<SegmentSource>,
}

#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(rename = "outputSettings", default)]
    pub output_settings: OutputSettings,
    pub units: Vec<UnitSource>,
    pub rules: Option<RulesOverrides>,
    #[serde(default)]
    pub apportionments: Vec<ApportionmentSource>,
    pub workers: Option<usize>,
}

pub fn read_batch_config(path: &Path) -> Form20Result<BatchConfig> {
    let path_s = path.display().to_string();
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu {
        path: path_s.clone(),
    })?;
    let config: BatchConfig =
        serde_json::from_str(&contents).context(ParsingJsonSnafu { path: path_s })?;
    debug!("read_batch_config: {:?}", config);
    Ok(config)
}

/// The rules of one unit: the policy preset first, then the overrides of the batch.
pub fn unit_rules(
    policy_name: Option<&str>,
    overrides: Option<&RulesOverrides>,
) -> Form20Result<ExtractionRules> {
    let mut rules = ExtractionRules::default();
    if let Some(name) = policy_name {
        rules.acceptance = AcceptancePolicy::by_name(name).context(UnknownPolicySnafu {
            name: name.to_string(),
        })?;
    }
    let o = match overrides {
        Some(o) => o,
        None => return Ok(rules),
    };

    if let Some((low, high)) = o.booth_id_range {
        rules.classifier.booth_id_range = low..=high;
    }
    if let Some((low, high)) = o.vote_sum_band {
        rules.classifier.vote_sum_band = low..=high;
    }
    if let Some(x) = o.abs_tolerance {
        rules.classifier.abs_tolerance = x;
    }
    if let Some(x) = o.rel_tolerance {
        rules.classifier.rel_tolerance = x;
    }
    if let Some(x) = o.min_row_coverage {
        rules.classifier.min_row_coverage = x;
    }
    if let Some(names) = &o.layouts {
        let mut layouts: Vec<SummaryLayout> = Vec::new();
        for name in names.iter() {
            match SummaryLayout::by_name(name) {
                Some(l) => layouts.push(l),
                None => whatever!("unknown summary layout: {}", name),
            }
        }
        rules.classifier.layouts = layouts;
    }
    if let Some(x) = o.strict_threshold {
        rules.matching.strict_threshold = x;
    }
    if let Some(x) = o.loose_threshold {
        rules.matching.loose_threshold = x;
    }
    if let Some(x) = o.materiality_floor {
        rules.matching.materiality_floor = x;
    }
    if let Some(x) = o.min_coverage {
        rules.acceptance.min_coverage = x;
    }
    if let Some(x) = o.max_mean_error {
        rules.acceptance.max_mean_error = x;
    }
    if let Some(x) = o.top_n {
        rules.acceptance.top_n = x;
    }
    Ok(rules)
}

pub fn read_reference(path: &str) -> Form20Result<JSValue> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let js: JSValue = serde_json::from_str(contents.as_str()).context(ParsingJsonSnafu { path })?;
    Ok(js)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_batch_config() {
        let js = r#"{
            "outputSettings": {"outputDirectory": "out"},
            "units": [
                {"unitId": "AC-1", "provider": "csv", "filePath": "ac1.csv",
                 "candidatesPath": "ac1_candidates.json", "expectedBooths": 12}
            ],
            "rules": {"voteSumBand": [10, 2500], "layouts": ["standard", "none"], "topN": 2},
            "apportionments": [
                {"parentUnitId": "PC-1", "candidatesPath": "pc1.json",
                 "segments": [{"unitId": "AC-1"}, {"unitId": "AC-2", "knownTotals": [10, 20]}]}
            ]
        }"#;
        let config: BatchConfig = serde_json::from_str(js).unwrap();
        assert_eq!(config.units.len(), 1);
        assert_eq!(config.units[0].expected_booths, Some(12));
        assert_eq!(config.units[0].policy, None);
        assert_eq!(config.apportionments[0].segments[1].known_totals, Some(vec![10, 20]));

        let rules = unit_rules(Some("lenient"), config.rules.as_ref()).unwrap();
        assert_eq!(rules.classifier.vote_sum_band, 10..=2500);
        assert_eq!(rules.classifier.layouts.len(), 2);
        assert_eq!(rules.acceptance.name, "lenient");
        assert_eq!(rules.acceptance.top_n, 2);
    }

    #[test]
    fn minimal_config() {
        let config: BatchConfig = serde_json::from_str(r#"{"units": []}"#).unwrap();
        assert_eq!(config.output_settings, OutputSettings::default());
        assert!(config.apportionments.is_empty());
    }

    #[test]
    fn unknown_names_are_errors() {
        assert!(unit_rules(Some("loose"), None).is_err());
        let o = RulesOverrides {
            layouts: Some(vec!["sideways".to_string()]),
            ..RulesOverrides::default()
        };
        assert!(unit_rules(None, Some(&o)).is_err());
    }
}
