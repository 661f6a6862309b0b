use crate::error::ErrorSri;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Nombre del archivo de log del modulo SRI
pub const ARCHIVO_LOG: &str = "sri_debug.log";

/// Instala el subscriber de tracing escribiendo en `<directorio>/sri_debug.log`.
///
/// El filtro se toma de `RUST_LOG`; por defecto `clouget_sri=info`.
/// Los cuerpos SOAP solo se registran en nivel debug.
pub fn inicializar_logs(directorio: &Path) -> Result<PathBuf, ErrorSri> {
    std::fs::create_dir_all(directorio)
        .map_err(|e| ErrorSri::Configuracion(format!("Error creando directorio de logs: {}", e)))?;

    let log_path = directorio.join(ARCHIVO_LOG);
    let archivo = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| ErrorSri::Configuracion(format!("Error abriendo log SRI: {}", e)))?;

    let filtro = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("clouget_sri=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filtro)
        .with_ansi(false)
        .with_target(false)
        .with_writer(Mutex::new(archivo))
        .try_init()
        .map_err(|e| ErrorSri::Configuracion(format!("Logger ya inicializado: {}", e)))?;

    Ok(log_path)
}
