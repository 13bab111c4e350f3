use crate::cli::ExtractArgs;
use anyhow::{Context, Result};
use plmfit_io::{fasta_dataset, read_fasta, DatasetColumns, EmbeddingStore};
use plmfit_plms::ExtractionRequest;
use tracing::info;

pub fn execute(args: ExtractArgs) -> Result<()> {
    let device = plmfit_plms::device(args.model.cpu)?;
    let dataset = match &args.fasta {
        Some(path) => {
            let records =
                read_fasta(path).with_context(|| format!("reading {}", path.display()))?;
            let mut dataset = fasta_dataset(&args.data.data_type, records)?;
            if let Some(wt) = args.data.wild_type()? {
                dataset.fill_mutation_positions(&wt);
            }
            dataset
        }
        None => args.data.load_dataset(&DatasetColumns::default())?,
    };
    let mut adapter = args.model.load(&device)?;
    adapter.set_max_len(args.data.max_len);

    let store = EmbeddingStore::new(&args.data.data_root);
    let request = ExtractionRequest::builder()
        .batch_size(args.batch_size)
        .layers(args.layers)
        .reductions(args.reductions)
        .overwrite(args.overwrite)
        .build();
    let embeddings = adapter.extract_embeddings(&dataset, &request, Some(&store))?;
    for (key, tensor) in &embeddings {
        info!("{} {:?}", store.path(key).display(), tensor.dims());
    }
    Ok(())
}
