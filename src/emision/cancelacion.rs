use crate::error::ErrorSri;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Extremo que cancela el sondeo
#[derive(Debug)]
pub struct Cancelador {
    tx: watch::Sender<bool>,
}

impl Cancelador {
    pub fn cancelar(&self) {
        // Sin receptores vivos no hay nada que cancelar
        let _ = self.tx.send(true);
    }
}

/// Senal observada por el orquestador entre intentos
#[derive(Debug, Clone)]
pub struct SenalCancelacion {
    rx: watch::Receiver<bool>,
}

/// Crea un par cancelador / senal
pub fn canal() -> (Cancelador, SenalCancelacion) {
    let (tx, rx) = watch::channel(false);
    (Cancelador { tx }, SenalCancelacion { rx })
}

impl SenalCancelacion {
    /// Senal que nunca se dispara
    pub fn nunca() -> Self {
        let (_tx, rx) = watch::channel(false);
        SenalCancelacion { rx }
    }

    pub fn cancelado(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn verificar(&self) -> Result<(), ErrorSri> {
        if self.cancelado() {
            return Err(ErrorSri::Cancelado("sondeo interrumpido".to_string()));
        }
        Ok(())
    }

    /// Duerme `duracion` o retorna `Cancelado` apenas llegue la senal.
    pub async fn esperar(&mut self, duracion: Duration) -> Result<(), ErrorSri> {
        self.verificar()?;
        if duracion.is_zero() {
            return Ok(());
        }

        let fin = Instant::now() + duracion;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(fin) => return Ok(()),
                cambio = self.rx.changed() => match cambio {
                    Ok(()) => self.verificar()?,
                    // Cancelador soltado: ya no puede llegar la senal
                    Err(_) => {
                        tokio::time::sleep_until(fin).await;
                        return Ok(());
                    }
                },
            }
        }
    }
}
