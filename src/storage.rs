use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use rand::{rngs::OsRng, RngCore};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};

use crate::error::Error;

const TOKEN_BYTES: usize = 16;
const MAX_EXTENSION_LEN: usize = 16;

/// Random filename stem shared by both files of one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadToken(String);

impl UploadToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        UploadToken(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extension of a client supplied filename, dot included.
///
/// Only short ASCII alphanumeric extensions survive; anything else yields an
/// empty string so the stored name is always `<token>` or `<token>.<ext>`.
pub fn extension_of(file_name: Option<&str>) -> String {
    let Some(ext) = file_name
        .map(Path::new)
        .and_then(Path::extension)
        .and_then(|ext| ext.to_str())
    else {
        return String::new();
    };

    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return String::new();
    }

    format!(".{ext}")
}

/// A part being streamed to disk under a hidden scratch name.
#[derive(Debug)]
pub struct StagedUpload {
    path: PathBuf,
    file: File,
    extension: String,
    len: u64,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|source| Error::Storage {
                path: self.path.clone(),
                source,
            })?;
        self.len += chunk.len() as u64;
        Ok(())
    }
}

/// Writes uploads into a single flat directory.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    /// Resolves `dir` against the current directory. The directory itself is
    /// not created.
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(dir)
        };
        Ok(UploadStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, token: &UploadToken, extension: &str) -> PathBuf {
        self.dir.join(format!("{token}{extension}"))
    }

    /// Hidden scratch path a part streams into before it is committed.
    fn staging_path(&self, token: &UploadToken, field: &str) -> PathBuf {
        self.dir.join(format!(".{token}.{field}.part"))
    }

    /// Opens a fresh staging file for one part of the request.
    pub async fn stage(
        &self,
        token: &UploadToken,
        field: &str,
        extension: String,
    ) -> Result<StagedUpload, Error> {
        let path = self.staging_path(token, field);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| Error::Storage {
                path: path.clone(),
                source,
            })?;
        Ok(StagedUpload {
            path,
            file,
            extension,
            len: 0,
        })
    }

    /// Moves a fully received part to `<dir>/<token><extension>`.
    pub async fn commit(
        &self,
        token: &UploadToken,
        staged: StagedUpload,
    ) -> Result<PathBuf, Error> {
        let StagedUpload {
            path: staging,
            mut file,
            extension,
            len,
        } = staged;
        let path = self.path_for(token, &extension);

        let renamed = match file.flush().await {
            Ok(()) => {
                drop(file);
                tokio::fs::rename(&staging, &path).await
            }
            Err(err) => Err(err),
        };
        renamed.map_err(|source| Error::Storage {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), len, "stored upload");
        Ok(path)
    }

    /// Commits the image and header of one request. On failure nothing of
    /// the pair is left behind, staged or committed.
    pub async fn commit_pair(
        &self,
        token: &UploadToken,
        image: StagedUpload,
        header: StagedUpload,
    ) -> Result<(PathBuf, PathBuf), Error> {
        let image_staging = image.path.clone();
        let header_staging = header.path.clone();
        let image_path = match self.commit(token, image).await {
            Ok(path) => path,
            Err(err) => {
                self.remove([image_staging, header_staging]).await;
                return Err(err);
            }
        };
        match self.commit(token, header).await {
            Ok(header_path) => Ok((image_path, header_path)),
            Err(err) => {
                self.remove([image_path, header_staging]).await;
                Err(err)
            }
        }
    }

    /// Best effort removal of stored files.
    pub async fn remove<P: AsRef<Path>>(&self, paths: impl IntoIterator<Item = P>) {
        for path in paths {
            let path = path.as_ref();
            if let Err(err) = tokio::fs::remove_file(path).await {
                if err.kind() == io::ErrorKind::NotFound {
                    continue;
                }
                tracing::warn!(path = %path.display(), error = %err, "failed to remove upload");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn token_is_32_lowercase_hex_chars() {
        let token = UploadToken::generate();
        assert_eq!(token.as_str().len(), 32);
        assert!(token
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn tokens_do_not_collide() {
        let tokens: HashSet<UploadToken> = (0..10_000).map(|_| UploadToken::generate()).collect();
        assert_eq!(tokens.len(), 10_000);
    }

    #[test]
    fn extension_keeps_the_last_suffix() {
        assert_eq!(extension_of(Some("scene.png")), ".png");
        assert_eq!(extension_of(Some("scene.hdr")), ".hdr");
        assert_eq!(extension_of(Some("cube.tar.img")), ".img");
    }

    #[test]
    fn extension_is_empty_when_absent_or_unsafe() {
        assert_eq!(extension_of(None), "");
        assert_eq!(extension_of(Some("noext")), "");
        assert_eq!(extension_of(Some(".hdr")), "");
        assert_eq!(extension_of(Some("scene.")), "");
        assert_eq!(extension_of(Some("scene.p g")), "");
        assert_eq!(extension_of(Some("x.png\\..\\evil")), "");
    }

    #[test]
    fn extension_ignores_directories_in_the_client_name() {
        assert_eq!(extension_of(Some("../../etc/passwd.img")), ".img");
        assert_eq!(extension_of(Some("a.dir/file")), "");
    }

    #[test]
    fn relative_dir_is_made_absolute() {
        let store = UploadStore::new("uploads").unwrap();
        assert!(store.dir().is_absolute());
        assert!(store.dir().ends_with("uploads"));
    }

    async fn stage_with(
        store: &UploadStore,
        token: &UploadToken,
        field: &str,
        extension: &str,
        chunks: &[&[u8]],
    ) -> StagedUpload {
        let mut staged = store
            .stage(token, field, extension.to_string())
            .await
            .unwrap();
        for chunk in chunks {
            staged.append(chunk).await.unwrap();
        }
        staged
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn staged_chunks_land_under_token_name() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();
        let token = UploadToken::generate();

        let chunks = [b"hyper".as_slice(), b"spectral".as_slice()];
        let staged = stage_with(&store, &token, "img", ".img", &chunks).await;
        assert!(staged.path().starts_with(dir.path()));
        assert!(entries(dir.path())[0].starts_with('.'));

        let path = store.commit(&token, staged).await.unwrap();

        assert_eq!(path, dir.path().join(format!("{token}.img")));
        assert_eq!(std::fs::read(&path).unwrap(), b"hyperspectral");
        assert_eq!(entries(dir.path()), vec![format!("{token}.img")]);
    }

    #[tokio::test]
    async fn staging_into_missing_dir_is_a_storage_error() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path().join("missing")).unwrap();

        let err = store
            .stage(&UploadToken::generate(), "img", ".img".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Storage { .. }));
    }

    #[tokio::test]
    async fn commit_pair_shares_the_token() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();
        let token = UploadToken::generate();
        let image = stage_with(&store, &token, "img", ".png", &[b"pixels".as_slice()]).await;
        let header = stage_with(&store, &token, "hdr", ".hdr", &[b"ENVI".as_slice()]).await;

        let (img, hdr) = store.commit_pair(&token, image, header).await.unwrap();

        assert_eq!(img.file_stem(), hdr.file_stem());
        assert_eq!(
            entries(dir.path()),
            vec![format!("{token}.hdr"), format!("{token}.png")]
        );
    }

    #[tokio::test]
    async fn failed_header_commit_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();
        let token = UploadToken::generate();
        let image = stage_with(&store, &token, "img", ".img", &[b"cube".as_slice()]).await;
        let header = stage_with(&store, &token, "hdr", ".hdr", &[b"ENVI".as_slice()]).await;
        // Pull the staged header away so its rename fails after the image moved.
        std::fs::remove_file(header.path()).unwrap();

        let err = store.commit_pair(&token, image, header).await.unwrap_err();

        assert!(matches!(err, Error::Storage { .. }));
        assert!(!store.path_for(&token, ".img").exists());
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn failed_image_commit_drops_both_staged_parts() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();
        let token = UploadToken::generate();
        let image = stage_with(&store, &token, "img", ".img", &[b"cube".as_slice()]).await;
        let header = stage_with(&store, &token, "hdr", ".hdr", &[b"ENVI".as_slice()]).await;
        std::fs::remove_file(image.path()).unwrap();

        store.commit_pair(&token, image, header).await.unwrap_err();

        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn remove_deletes_files_and_ignores_missing_ones() {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path()).unwrap();
        let token = UploadToken::generate();
        let staged = stage_with(&store, &token, "img", ".img", &[b"a".as_slice()]).await;
        let img = store.commit(&token, staged).await.unwrap();

        store
            .remove([img.clone(), dir.path().join("never-written")])
            .await;

        assert!(!img.exists());
    }
}
