use std::{path::PathBuf, sync::Arc};

use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::Error,
    storage::{extension_of, StagedUpload, UploadStore, UploadToken},
    AppState,
};

const IMAGE_FIELD: &str = "img";
const HEADER_FIELD: &str = "hdr";

/// File parts of one request, streamed to disk as they arrive.
#[derive(Default)]
struct StagedPair {
    image: Option<StagedUpload>,
    header: Option<StagedUpload>,
}

impl StagedPair {
    fn paths(&self) -> Vec<PathBuf> {
        [&self.image, &self.header]
            .into_iter()
            .flatten()
            .map(|staged| staged.path().to_path_buf())
            .collect()
    }
}

/// Streams the first `img` and first `hdr` file parts into staging files.
///
/// Parts without a filename are form values, not files, and are skipped
/// like every other field.
async fn stage_uploads(
    multipart: &mut Multipart,
    store: &UploadStore,
    token: &UploadToken,
    staged: &mut StagedPair,
) -> Result<(), Error> {
    while let Some(mut field) = multipart.next_field().await? {
        let (slot, name) = match field.name() {
            Some(IMAGE_FIELD) => (&mut staged.image, IMAGE_FIELD),
            Some(HEADER_FIELD) => (&mut staged.header, HEADER_FIELD),
            _ => continue,
        };
        if slot.is_some() {
            continue;
        }
        let Some(file_name) = field.file_name() else {
            continue;
        };

        let extension = extension_of(Some(file_name));
        let upload = slot.insert(store.stage(token, name, extension).await?);
        while let Some(chunk) = field.chunk().await? {
            upload.append(&chunk).await?;
        }
    }

    Ok(())
}

pub async fn predict_handler(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, Error> {
    // A body that is not multipart carries no files at all.
    let mut multipart = multipart.map_err(|rejection| {
        tracing::debug!(%rejection, "request is not multipart");
        Error::MissingUploads
    })?;

    let token = UploadToken::generate();
    let mut staged = StagedPair::default();
    if let Err(err) = stage_uploads(&mut multipart, &state.store, &token, &mut staged).await {
        state.store.remove(staged.paths()).await;
        return Err(err);
    }

    let (image, header) = match staged {
        StagedPair {
            image: Some(image),
            header: Some(header),
        } => (image, header),
        partial => {
            state.store.remove(partial.paths()).await;
            return Err(Error::MissingUploads);
        }
    };

    let (image_path, header_path) = state.store.commit_pair(&token, image, header).await?;
    tracing::info!(
        image = %image_path.display(),
        header = %header_path.display(),
        "stored uploads"
    );

    let outcome = state.predictor.run(&image_path, &header_path).await;

    if state.remove_uploads {
        state.store.remove([&image_path, &header_path]).await;
    }

    // Exit code is logged by the predictor but only stdout decides the response.
    let prediction = outcome?.parse_prediction()?;
    Ok(Json(prediction))
}

pub async fn root() -> &'static str {
    "Moisture prediction API is running"
}

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}
