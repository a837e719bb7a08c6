use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Model file not found: {0}")]
    ModelMissing(String),
    #[error("Failed to create session: {0}")]
    SessionCreation(String),
}

/// Load an ONNX model into a CPU session
///
/// `intra_threads == 0` leaves the thread count to ONNX Runtime.
pub fn load_session<P: AsRef<Path>>(model_path: P, intra_threads: usize) -> Result<Session, RuntimeError> {
    let model_path = model_path.as_ref();
    if !model_path.exists() {
        return Err(RuntimeError::ModelMissing(model_path.display().to_string()));
    }

    let mut builder = Session::builder()
        .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?;

    if intra_threads > 0 {
        builder = builder
            .with_intra_threads(intra_threads)
            .map_err(|e| RuntimeError::SessionCreation(e.to_string()))?;
    }

    let session = builder.commit_from_file(model_path).map_err(|e| {
        RuntimeError::SessionCreation(format!(
            "Failed to load model from {}: {}",
            model_path.display(),
            e
        ))
    })?;

    log::info!("Loaded ONNX model: {}", model_path.display());
    Ok(session)
}
