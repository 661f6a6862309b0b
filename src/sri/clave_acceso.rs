use crate::config::{solo_digitos, Ambiente};
use crate::error::ErrorSri;
use crate::models::TipoComprobante;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tipo de emision normal (posicion 48)
pub const EMISION_NORMAL: &str = "1";

const LONGITUD_BASE: usize = 48;

/// Clave de acceso de 49 digitos validada (48 de contenido + verificador).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClaveAcceso {
    valor: String,
    fecha: NaiveDate,
}

impl ClaveAcceso {
    pub fn as_str(&self) -> &str {
        &self.valor
    }

    /// Posiciones 1-8: fecha de emision
    pub fn fecha_emision(&self) -> NaiveDate {
        self.fecha
    }

    /// Posiciones 31-39: secuencial del comprobante
    pub fn secuencial(&self) -> &str {
        &self.valor[30..39]
    }

    /// Posiciones 9-10: codigo del tipo de documento
    pub fn cod_doc(&self) -> &str {
        &self.valor[8..10]
    }
}

impl fmt::Display for ClaveAcceso {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.valor)
    }
}

impl FromStr for ClaveAcceso {
    type Err = ErrorSri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != LONGITUD_BASE + 1 || !solo_digitos(s) {
            return Err(ErrorSri::Validacion(format!(
                "La clave de acceso debe tener 49 digitos: '{}'",
                s
            )));
        }
        let (base, dv) = s.split_at(LONGITUD_BASE);
        if dv != digito_verificador_modulo11(base).to_string() {
            return Err(ErrorSri::Validacion(format!(
                "Digito verificador incorrecto en clave de acceso '{}'",
                s
            )));
        }
        let fecha = NaiveDate::parse_from_str(&s[0..8], "%d%m%Y").map_err(|_| {
            ErrorSri::Validacion(format!("Fecha invalida en clave de acceso '{}'", s))
        })?;
        Ok(ClaveAcceso {
            valor: s.to_string(),
            fecha,
        })
    }
}

impl TryFrom<String> for ClaveAcceso {
    type Error = ErrorSri;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ClaveAcceso> for String {
    fn from(clave: ClaveAcceso) -> String {
        clave.valor
    }
}

/// Genera la clave de acceso de 49 digitos para comprobantes electronicos SRI.
///
/// Estructura (48 digitos + 1 digito verificador):
/// - Posiciones 1-8:   fecha emision (ddmmyyyy)
/// - Posiciones 9-10:  codigo documento (01=factura, 04=nota credito)
/// - Posiciones 11-23: RUC emisor (13 digitos)
/// - Posicion 24:      ambiente (1=pruebas, 2=produccion)
/// - Posiciones 25-27: establecimiento (3 digitos)
/// - Posiciones 28-30: punto de emision (3 digitos)
/// - Posiciones 31-39: secuencial (9 digitos)
/// - Posiciones 40-47: codigo numerico (8 digitos)
/// - Posicion 48:      tipo emision (1=normal)
/// - Posicion 49:      digito verificador (modulo 11)
///
/// El codigo numerico lo inyecta el llamador para que la generacion sea
/// determinista. Si algun campo no produce exactamente 48 digitos (RUC corto,
/// secuencial de mas de 9 cifras, etc.) retorna `Validacion` en vez de
/// truncar o rellenar.
pub fn generar_clave_acceso(
    fecha_emision: NaiveDate,
    tipo: TipoComprobante,
    ruc: &str,
    ambiente: Ambiente,
    establecimiento: &str,
    punto_emision: &str,
    secuencial: u64,
    codigo_numerico: u32,
    tipo_emision: &str,
) -> Result<ClaveAcceso, ErrorSri> {
    let base = format!(
        "{}{}{}{}{}{}{:09}{:08}{}",
        fecha_emision.format("%d%m%Y"),
        tipo.codigo(),
        ruc,
        ambiente.codigo(),
        establecimiento,
        punto_emision,
        secuencial,
        codigo_numerico,
        tipo_emision,
    );

    if base.len() != LONGITUD_BASE || !solo_digitos(&base) {
        return Err(ErrorSri::Validacion(format!(
            "La base de la clave de acceso debe tener 48 digitos, tiene {}: '{}'",
            base.len(),
            base
        )));
    }

    let dv = digito_verificador_modulo11(&base);
    Ok(ClaveAcceso {
        valor: format!("{}{}", base, dv),
        fecha: fecha_emision,
    })
}

/// Codigo numerico aleatorio de 8 digitos para la clave de acceso
pub fn codigo_numerico_aleatorio() -> u32 {
    use rand::Rng;
    rand::thread_rng().gen_range(10_000_000..=99_999_999)
}

/// Calcula el digito verificador usando modulo 11 con pesos [2,3,4,5,6,7]
/// ciclicos desde derecha a izquierda.
pub fn digito_verificador_modulo11(cadena: &str) -> u32 {
    let pesos = [2, 3, 4, 5, 6, 7];
    let mut suma: u32 = 0;

    for (i, ch) in cadena.chars().rev().enumerate() {
        let digito = ch.to_digit(10).unwrap_or(0);
        let peso = pesos[i % pesos.len()];
        suma += digito * peso;
    }

    let residuo = suma % 11;
    match 11 - residuo {
        11 => 0,
        10 => 1,
        dv => dv,
    }
}
