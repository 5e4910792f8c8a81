use std::path::PathBuf;

pub fn data_dir() -> PathBuf {
    if let Ok(p) = std::env::var("VOXKEY_DATA_DIR") {
        if !p.trim().is_empty() {
            return PathBuf::from(p);
        }
    }
    // Dev default: repo-root/tmp/voxkey-data
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tmp")
        .join("voxkey-data")
}
