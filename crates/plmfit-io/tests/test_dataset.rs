use anyhow::Context;
use plmfit_core::{Split, TaskKind};
use plmfit_io::{
    dataset_path, fasta_dataset, load_dataset, read_fasta, DatasetColumns, HeadConfig,
    NetworkType, WildType,
};
use plmfit_test_data::TestFile;

#[test]
fn test_load_toy_dataset() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = TestFile::toy_dataset().write_to(dataset_path(dir.path(), "toy"))?;
    let ds = load_dataset(&path, &DatasetColumns::default())?;

    assert_eq!(ds.name, "toy");
    assert_eq!(ds.len(), 24);
    assert_eq!(ds.max_len(), 10);

    let first = &ds.records()[0];
    assert_eq!(first.aa_seq, "MKTAYIAKQR");
    assert_eq!(first.split, Some(Split::Train));
    assert_eq!(first.mutation_positions, Some(vec![]));
    assert_eq!(ds.records()[1].mutation_positions, Some(vec![2]));

    let (train, test) = ds.split_indices()?;
    assert_eq!(train.len(), 18);
    assert_eq!(test, vec![3, 7, 11, 15, 19, 23]);

    let labels = ds.labels(TaskKind::Classification)?;
    assert!(labels.iter().all(|v| *v == 0.0 || *v == 1.0));
    assert!(ds.mutation_positions().is_some());
    Ok(())
}

#[test]
fn test_mutation_masks_agree_with_wild_type() -> anyhow::Result<()> {
    let (csv, _csv) = TestFile::toy_dataset().create_temp()?;
    let (wt, _wt) = TestFile::toy_wild_type().create_temp()?;
    let ds = load_dataset(&csv, &DatasetColumns::default())?;
    let wild_type = WildType::from_file(&wt)?;

    for record in ds.records() {
        let derived: Vec<usize> = wild_type
            .mutations(&record.aa_seq)?
            .into_iter()
            .map(|(pos, _, _)| pos)
            .collect();
        assert_eq!(Some(derived), record.mutation_positions);
    }
    Ok(())
}

#[test]
fn test_custom_split_column_missing() -> anyhow::Result<()> {
    let (csv, _csv) = TestFile::toy_dataset().create_temp()?;
    let columns = DatasetColumns::default().with_split_column("partition");
    let ds = load_dataset(&csv, &columns)?;
    assert!(ds.split_indices().is_err());
    Ok(())
}

#[test]
fn test_read_fasta_fixture() -> anyhow::Result<()> {
    let (fasta, _fasta) = TestFile::toy_fasta().create_temp()?;
    let records = read_fasta(&fasta)?;
    assert_eq!(records.len(), 5);
    assert_eq!(records[0].id, "variant_0");
    assert_eq!(records[0].sequence, "MKTAYIAKQR");

    let ds = fasta_dataset("toy", records)?;
    assert_eq!(ds.len(), 5);
    assert_eq!(ds.max_len(), 10);
    assert!(ds.labels(TaskKind::Regression).is_err());
    Ok(())
}

#[test]
fn test_negative_length_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dataset_path(dir.path(), "bad");
    std::fs::create_dir_all(path.parent().context("dataset path has a parent")?)?;
    std::fs::write(
        &path,
        "aa_seq,len,set,score\nMKTAYIAKQR,10,train,0.5\nMKTAY,-5,test,0.1\n",
    )?;
    let err = load_dataset(&path, &DatasetColumns::default());
    assert!(matches!(err, Err(plmfit_core::PlmfitError::Dataset(_))));
    Ok(())
}

#[test]
fn test_head_config_fixtures() -> anyhow::Result<()> {
    let (linear, _l) = TestFile::linear_head_config().create_temp()?;
    let (mlp, _m) = TestFile::mlp_head_config().create_temp()?;
    let linear = HeadConfig::from_file(&linear)?;
    let mlp = HeadConfig::from_file(&mlp)?;
    assert_eq!(linear.network_type, NetworkType::Linear);
    assert_eq!(linear.training_parameters.early_stopping, Some(2));
    assert_eq!(mlp.hidden_dim, Some(8));
    assert!(mlp.training_parameters.loss_scaling);
    Ok(())
}
