//! Hyperparameter tuning placeholder
//!
//! No search is performed: the configured hyperparameter set is written out
//! unchanged so the training stage always reads its parameters from a file.

use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use crate::config::TrainingHyperparameters;

pub fn write_dummy_hyperparameters(params: &TrainingHyperparameters, output_file: &Path) -> Result<()> {
    warn!("Hyperparameter search is not implemented, writing the configured defaults");
    params.save(output_file)?;
    info!(
        path = %output_file.display(),
        learning_rate = params.learning_rate,
        "Hyperparameters written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn test_written_file_is_readable_by_training() {
        let config = PipelineConfig::from_yaml(crate::config::tests::SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join("hyperparameters.yaml");

        let params = &config.hyperparameter_tuning.dummy_hyperparameters;
        write_dummy_hyperparameters(params, &out).unwrap();

        assert_eq!(&TrainingHyperparameters::load(&out).unwrap(), params);
    }
}
