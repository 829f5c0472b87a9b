use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to bind the HTTP server on
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the HTTP server on
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Directory holding the serialized model weights
    #[arg(long, default_value = "models")]
    pub model_dir: String,

    /// Anomaly cutoff applied to the normalized score map
    #[arg(long, default_value_t = 0.5)]
    pub threshold: f32,

    /// Apply adaptive contrast enhancement (CLAHE) before resizing
    #[arg(long, default_value_t = false)]
    pub enhance_contrast: bool,

    /// Attach the preprocessed image to every result record
    #[arg(long, default_value_t = false)]
    pub include_processed: bool,

    /// Run inference on the CUDA execution provider
    #[arg(long, default_value_t = false)]
    pub cuda: bool,
}
