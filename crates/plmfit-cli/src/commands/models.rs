use anyhow::Result;
use plmfit_plms::PretrainedModels;
use strum::IntoEnumIterator;

pub fn execute() -> Result<()> {
    for model in PretrainedModels::iter() {
        let (repo, revision) = model.get_model_files();
        let preset = model.preset();
        println!(
            "{:<22} {:<8} hidden={:<5} {repo}@{revision}",
            model.to_string(),
            model.family().to_string(),
            preset.hidden_size()
        );
    }
    Ok(())
}
