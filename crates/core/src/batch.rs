//! Batched multi-object move and stream-through copy

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorCollector, Result};
use crate::options::CopyOptions;
use crate::traits::Bucket;

/// Copy by reading from `source` and writing into the destination bucket
pub async fn stream_copy<B: Bucket + ?Sized>(
    source: &B,
    ctx: &CancellationToken,
    options: &CopyOptions,
) -> Result<()> {
    let reader = source.get(ctx, &options.source_key).await?;
    options
        .destination_bucket
        .put(ctx, &options.destination_key, reader)
        .await
}

/// Move `source_keys` from `source` to `destination_keys` in `destination`
///
/// Keys are processed in batches of `source.batch_size()`. A batch's source
/// keys are removed only when every copy in that batch succeeded; a failed
/// batch is reported and the next batch still runs.
pub async fn move_objects<B: Bucket + ?Sized>(
    source: &B,
    ctx: &CancellationToken,
    destination: Arc<dyn Bucket>,
    source_keys: &[String],
    destination_keys: &[String],
) -> Result<()> {
    if source_keys.len() != destination_keys.len() {
        return Err(Error::InvalidKey(format!(
            "{} source keys but {} destination keys",
            source_keys.len(),
            destination_keys.len()
        )));
    }

    let batch_size = source.batch_size().max(1);
    let collector = ErrorCollector::new();

    let batches = source_keys
        .chunks(batch_size)
        .zip(destination_keys.chunks(batch_size));
    for (batch, (sources, destinations)) in batches.enumerate() {
        if ctx.is_cancelled() {
            collector.add(Error::Canceled);
            break;
        }

        let copies = sources.iter().zip(destinations).map(|(src, dst)| {
            let options = CopyOptions::new(src.as_str(), dst.as_str(), destination.clone());
            async move {
                source
                    .copy(ctx, options)
                    .await
                    .map_err(|e| e.context(format!("copying '{src}' to '{dst}'")))
            }
        });
        let batch_errors = ErrorCollector::new();
        for result in join_all(copies).await {
            batch_errors.check(result);
        }

        if batch_errors.has_errors() {
            tracing::warn!(
                batch = batch,
                failed = batch_errors.len(),
                "copy failed, keeping batch sources"
            );
            if let Err(e) = batch_errors.resolve() {
                collector.add(e);
            }
            continue;
        }

        tracing::debug!(batch = batch, keys = sources.len(), "removing moved sources");
        if let Err(e) = source.remove_many(ctx, sources).await {
            collector.add(e.context(format!("removing sources of batch {batch}")));
        }
    }

    collector.resolve()
}
