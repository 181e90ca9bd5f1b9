use image::{Rgb, RgbImage};
use inpaint_pipeline::config::PipelineConfig;
use inpaint_pipeline::files;
use inpaint_pipeline::masking::{GROUND_TRUTH_DIR, MASKS_DIR};
use inpaint_pipeline::splitting::Split;
use inpaint_pipeline::stages::{run_pipeline, Stage};
use std::path::Path;

fn config_rooted_at(root: &Path) -> PipelineConfig {
    let text = std::fs::read_to_string("config/smoke_test_config.yaml").unwrap();
    let text = text.replace("artifacts_smoke/", &format!("{}/", root.display()));
    PipelineConfig::from_yaml(&text).unwrap()
}

fn write_raw_images(dir: &Path, count: u32) {
    std::fs::create_dir_all(dir).unwrap();
    for i in 0..count {
        let img = RgbImage::from_fn(80 + i, 60, |x, y| Rgb([(x * 3) as u8, (y * 4) as u8, (i * 20) as u8]));
        img.save(dir.join(format!("painting_{i:02}.jpg"))).unwrap();
    }
}

#[test]
fn test_shipped_configs_are_valid() {
    for path in ["config/main_config.yaml", "config/smoke_test_config.yaml"] {
        let config = PipelineConfig::load(Path::new(path)).unwrap();
        assert_eq!(config.data_splitting.test_size, 0.2);
    }
}

#[tokio::test]
async fn test_processing_splitting_and_masking_produce_a_paired_dataset() {
    let root = tempfile::tempdir().unwrap();
    let config = config_rooted_at(root.path());
    write_raw_images(&config.data_paths.raw_images, 10);

    let ids: Vec<String> = ["2", "3", "4", "5", "6"].iter().map(|s| s.to_string()).collect();
    let report = run_pipeline(&ids, &config).await;
    assert_eq!(report.failed, None);
    assert_eq!(report.completed.len(), 5);
    assert!(report.completed.contains(&Stage::FeatureEngineering));

    let processed = files::list_files(&config.data_paths.processed_images, &[".png"]).unwrap();
    assert_eq!(processed.len(), 10);
    let [w, h] = config.data_processing.image_size;
    assert_eq!(image::image_dimensions(&processed[0]).unwrap(), (w, h));

    let expected = [(Split::Train, 7), (Split::Validation, 1), (Split::Test, 2)];
    let mut total = 0;
    for (split, count) in expected {
        let split_files = files::list_files(&config.data_paths.split_data.join(split.dir_name()), &[]).unwrap();
        assert_eq!(split_files.len(), count, "{split}");
        total += split_files.len();

        let dataset = config.data_paths.inpainting_dataset.join(split.dir_name());
        let truths: Vec<String> = files::list_files(&dataset.join(GROUND_TRUTH_DIR), &[])
            .unwrap()
            .iter()
            .map(|p| files::file_name(p))
            .collect();
        let masks: Vec<String> = files::list_files(&dataset.join(MASKS_DIR), &[])
            .unwrap()
            .iter()
            .map(|p| files::file_name(p))
            .collect();
        assert_eq!(truths, masks);
        assert_eq!(truths.len(), count);
    }
    assert_eq!(total, 10);

    assert!(config.exploratory_data_analysis.output_dir.join("full_image_metadata.csv").is_file());
    assert!(config.hyperparameter_tuning.output_file.is_file());
}

#[tokio::test]
async fn test_rerunning_masking_reproduces_identical_masks() {
    let root = tempfile::tempdir().unwrap();
    let config = config_rooted_at(root.path());
    write_raw_images(&config.data_paths.raw_images, 4);

    let ids: Vec<String> = ["3", "4", "5"].iter().map(|s| s.to_string()).collect();
    run_pipeline(&ids, &config).await;
    let masks_dir = config.data_paths.inpainting_dataset.join("train").join(MASKS_DIR);
    let first: Vec<Vec<u8>> = files::list_files(&masks_dir, &[])
        .unwrap()
        .iter()
        .map(|p| std::fs::read(p).unwrap())
        .collect();

    run_pipeline(&ids[2..], &config).await;
    let second: Vec<Vec<u8>> = files::list_files(&masks_dir, &[])
        .unwrap()
        .iter()
        .map(|p| std::fs::read(p).unwrap())
        .collect();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}
