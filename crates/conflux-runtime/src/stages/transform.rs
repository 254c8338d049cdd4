//! Transform stage

use conflux_core::interpreter::{Outcome, Program};
use conflux_core::transforms::{OnError, TransformConfig};
use conflux_core::{Record, Result};

use crate::error::FailureDetail;

/// Records after the transform program ran
#[derive(Debug, Default)]
pub struct TransformOutput {
    /// Transformed records
    pub records: Vec<Record>,
    /// Records dropped by filter transforms
    pub filtered: usize,
    /// Records skipped after a transform failed on them
    pub failures: Vec<FailureDetail>,
}

impl TransformOutput {
    /// Records that left the stream
    pub fn skipped(&self) -> usize {
        self.filtered + self.failures.len()
    }
}

/// Applies a compiled transform list to every record
pub struct Transformer {
    program: Program,
}

impl Transformer {
    /// Compile `transforms`
    pub fn new(transforms: &[TransformConfig]) -> Result<Self> {
        Ok(Self {
            program: Program::compile(transforms)?,
        })
    }

    /// Run every record through the program, in order
    ///
    /// A failing record is skipped when its transform says `onError: skip`,
    /// or when it says nothing and `continue_on_error` is set; otherwise the
    /// first failure aborts the stage.
    pub fn transform(&self, records: Vec<Record>, continue_on_error: bool) -> Result<TransformOutput> {
        if self.program.is_empty() {
            return Ok(TransformOutput {
                records,
                ..Default::default()
            });
        }

        let mut output = TransformOutput {
            records: Vec::with_capacity(records.len()),
            ..Default::default()
        };
        for record in records {
            match self.program.apply(&record.data) {
                Ok(Outcome::Keep(data)) if data == record.data => output.records.push(record),
                Ok(Outcome::Keep(data)) => output.records.push(record.revise(data)),
                Ok(Outcome::Filtered) => output.filtered += 1,
                Err(failure) => {
                    let skip = match failure.on_error {
                        Some(OnError::Skip) => true,
                        Some(OnError::Abort) => false,
                        None => continue_on_error,
                    };
                    if !skip {
                        return Err(failure.error);
                    }
                    tracing::warn!(record = %record.id, error = %failure.error, "skipping record");
                    output.failures.push(
                        FailureDetail::from_error(&failure.error)
                            .at("transform")
                            .for_record(&record.id),
                    );
                }
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conflux_core::Error;
    use serde_json::json;

    fn transforms(yaml: &str) -> Vec<TransformConfig> {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn records() -> Vec<Record> {
        vec![
            Record::from_value("s", json!({"name": "ada", "age": "36"})),
            Record::from_value("s", json!({"name": "bob", "age": "x"})),
            Record::from_value("s", json!({"name": "cy", "age": "7", "debug": true})),
        ]
    }

    #[test]
    fn test_changed_records_get_new_version() {
        let stage = Transformer::new(&transforms("- drop: [debug]\n")).unwrap();
        let out = stage.transform(records(), false).unwrap();
        assert_eq!(out.records.len(), 3);
        assert_eq!(out.records[0].version, 1);
        assert_eq!(out.records[2].version, 2);
        assert!(out.records[2].get("debug").is_none());
    }

    #[test]
    fn test_cast_failure_aborts_without_continue() {
        let stage = Transformer::new(&transforms("- cast: { age: Integer }\n")).unwrap();
        let err = stage.transform(records(), false).unwrap_err();
        assert!(matches!(err, Error::TransformError { .. }));
    }

    #[test]
    fn test_cast_failure_skipped_with_continue() {
        let stage = Transformer::new(&transforms("- cast: { age: Integer }\n")).unwrap();
        let out = stage.transform(records(), true).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.skipped(), 1);
        assert_eq!(out.records[0].get("age"), Some(&json!(36)));
    }

    #[test]
    fn test_transform_on_error_overrides_run_flag() {
        let stage = Transformer::new(&transforms(
            "- cast: { age: Integer }\n  onError: skip\n",
        ))
        .unwrap();
        assert_eq!(stage.transform(records(), false).unwrap().records.len(), 2);

        let stage = Transformer::new(&transforms(
            "- cast: { age: Integer }\n  onError: abort\n",
        ))
        .unwrap();
        assert!(stage.transform(records(), true).is_err());
    }

    #[test]
    fn test_filter_counts_dropped_records() {
        let stage = Transformer::new(&transforms(
            "- filter: { field: name, operator: StartsWith, value: b }\n",
        ))
        .unwrap();
        let out = stage.transform(records(), false).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.filtered, 2);
        assert!(out.failures.is_empty());
    }

    #[test]
    fn test_empty_program_passes_through() {
        let stage = Transformer::new(&[]).unwrap();
        let out = stage.transform(records(), false).unwrap();
        assert_eq!(out.records.len(), 3);
        assert!(out.records.iter().all(|r| r.version == 1));
    }
}
