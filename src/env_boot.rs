use std::path::Path;

/// Load `.env` from the working directory, falling back to the crate root so
/// `cargo run` from a subdirectory still picks up local credentials.
/// Returns the file that was loaded, if any.
pub fn ensure_dotenv() -> Option<std::path::PathBuf> {
    if let Ok(path) = dotenv::dotenv() {
        return Some(path);
    }
    let candidate = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    dotenv::from_path(&candidate).ok().map(|_| candidate)
}
