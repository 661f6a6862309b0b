//! Configuracion del emisor y del cliente SRI.
//!
//! Ambas estructuras se construyen desde el mapa clave/valor de la tabla
//! `config` de cada tenant, igual que el resto de ajustes del negocio.
use crate::error::ErrorSri;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Ambiente del SRI: determina endpoints y el digito 24 de la clave de acceso.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ambiente {
    Pruebas,
    Produccion,
}

impl Ambiente {
    /// Codigo usado en la clave de acceso y en `<ambiente>`
    pub fn codigo(&self) -> &'static str {
        match self {
            Ambiente::Pruebas => "1",
            Ambiente::Produccion => "2",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Ambiente::Pruebas => "pruebas",
            Ambiente::Produccion => "produccion",
        }
    }
}

impl fmt::Display for Ambiente {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ambiente {
    type Err = ErrorSri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "pruebas" => Ok(Ambiente::Pruebas),
            "2" | "produccion" => Ok(Ambiente::Produccion),
            otro => Err(ErrorSri::Configuracion(format!(
                "Ambiente invalido '{}'. Use 'pruebas' o 'produccion'",
                otro
            ))),
        }
    }
}

/// Regimen RIMPE del contribuyente (leyenda `contribuyenteRimpe`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegimenRimpe {
    Emprendedor,
    NegocioPopular,
}

impl RegimenRimpe {
    pub fn leyenda(&self) -> &'static str {
        match self {
            RegimenRimpe::Emprendedor => "CONTRIBUYENTE RÉGIMEN RIMPE",
            RegimenRimpe::NegocioPopular => "CONTRIBUYENTE NEGOCIO POPULAR - RÉGIMEN RIMPE",
        }
    }
}

/// Identidad tributaria del emisor. Inmutable durante una emision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentidadFiscal {
    pub ruc: String,
    pub razon_social: String,
    pub nombre_comercial: Option<String>,
    pub dir_matriz: String,
    pub dir_establecimiento: String,
    pub ambiente: Ambiente,
    pub establecimiento: String,
    pub punto_emision: String,
    pub obligado_contabilidad: bool,
    /// Numero de resolucion de contribuyente especial
    pub contribuyente_especial: Option<String>,
    pub regimen_rimpe: Option<RegimenRimpe>,
}

impl IdentidadFiscal {
    /// Construye la identidad desde la configuracion del tenant.
    pub fn desde_mapa(cfg: &HashMap<String, String>) -> Result<Self, ErrorSri> {
        let get = |key: &str| -> Option<String> {
            cfg.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let ruc = get("ruc").ok_or_else(|| {
            ErrorSri::Configuracion("Configure el RUC del negocio antes de emitir".to_string())
        })?;

        let razon_social = get("razon_social")
            .or_else(|| get("nombre_negocio"))
            .ok_or_else(|| ErrorSri::Configuracion("Falta la razon social del negocio".to_string()))?;

        let dir_matriz = get("direccion")
            .ok_or_else(|| ErrorSri::Configuracion("Falta la direccion matriz".to_string()))?;
        let dir_establecimiento = get("direccion_establecimiento").unwrap_or_else(|| dir_matriz.clone());

        let ambiente = match get("sri_ambiente") {
            Some(valor) => valor.parse()?,
            None => Ambiente::Pruebas,
        };

        let regimen_rimpe = match get("regimen").as_deref() {
            Some("RIMPE_EMPRENDEDOR") => Some(RegimenRimpe::Emprendedor),
            Some("RIMPE_POPULAR") => Some(RegimenRimpe::NegocioPopular),
            _ => None,
        };

        let identidad = IdentidadFiscal {
            ruc,
            razon_social,
            nombre_comercial: get("nombre_comercial"),
            dir_matriz,
            dir_establecimiento,
            ambiente,
            establecimiento: get("establecimiento").unwrap_or_else(|| "001".to_string()),
            punto_emision: get("punto_emision").unwrap_or_else(|| "001".to_string()),
            obligado_contabilidad: get("obligado_contabilidad").as_deref() == Some("SI"),
            contribuyente_especial: get("contribuyente_especial"),
            regimen_rimpe,
        };
        identidad.validar()?;
        Ok(identidad)
    }

    /// Verifica formatos que el SRI exige antes de generar la clave de acceso.
    pub fn validar(&self) -> Result<(), ErrorSri> {
        if self.ruc.len() != 13 || !solo_digitos(&self.ruc) {
            return Err(ErrorSri::Configuracion(format!(
                "El RUC debe tener 13 digitos: '{}'",
                self.ruc
            )));
        }
        if self.establecimiento.len() != 3 || !solo_digitos(&self.establecimiento) {
            return Err(ErrorSri::Configuracion(format!(
                "Codigo de establecimiento invalido: '{}'",
                self.establecimiento
            )));
        }
        if self.punto_emision.len() != 3 || !solo_digitos(&self.punto_emision) {
            return Err(ErrorSri::Configuracion(format!(
                "Codigo de punto de emision invalido: '{}'",
                self.punto_emision
            )));
        }
        if self.razon_social.trim().is_empty() {
            return Err(ErrorSri::Configuracion("La razon social esta vacia".to_string()));
        }
        Ok(())
    }

    pub fn obligado_contabilidad_sri(&self) -> &'static str {
        if self.obligado_contabilidad {
            "SI"
        } else {
            "NO"
        }
    }
}

/// Parametros del cliente SOAP y del sondeo de autorizacion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSri {
    pub timeout_http: Duration,
    /// Esperas antes de cada intento de recepcion (el primero suele ser 0)
    pub esperas_recepcion: Vec<Duration>,
    /// Esperas antes de cada consulta de autorizacion
    pub esperas_autorizacion: Vec<Duration>,
    /// Aceptar certificados TLS invalidos solo en el ambiente de pruebas
    pub tls_permisivo_pruebas: bool,
}

impl Default for ConfigSri {
    fn default() -> Self {
        ConfigSri {
            timeout_http: Duration::from_secs(60),
            esperas_recepcion: segundos(&[0, 3, 5]),
            esperas_autorizacion: segundos(&[0, 3, 5, 8, 12, 15, 20, 25]),
            tls_permisivo_pruebas: false,
        }
    }
}

impl ConfigSri {
    pub fn desde_mapa(cfg: &HashMap<String, String>) -> Result<Self, ErrorSri> {
        let mut config = ConfigSri::default();

        if let Some(valor) = cfg.get("sri_timeout_segundos").filter(|v| !v.is_empty()) {
            let secs: u64 = valor.trim().parse().map_err(|_| {
                ErrorSri::Configuracion(format!("sri_timeout_segundos invalido: '{}'", valor))
            })?;
            if secs == 0 {
                return Err(ErrorSri::Configuracion(
                    "sri_timeout_segundos debe ser mayor a 0".to_string(),
                ));
            }
            config.timeout_http = Duration::from_secs(secs);
        }
        if let Some(valor) = cfg.get("sri_esperas_recepcion").filter(|v| !v.is_empty()) {
            config.esperas_recepcion = parsear_esperas("sri_esperas_recepcion", valor)?;
        }
        if let Some(valor) = cfg.get("sri_esperas_autorizacion").filter(|v| !v.is_empty()) {
            config.esperas_autorizacion = parsear_esperas("sri_esperas_autorizacion", valor)?;
        }
        config.tls_permisivo_pruebas = cfg
            .get("sri_tls_permisivo_pruebas")
            .map(|v| v == "1")
            .unwrap_or(false);

        Ok(config)
    }

    /// Esperas de prueba sin demoras, para tests y ambientes simulados
    pub fn sin_esperas(intentos_autorizacion: usize) -> Self {
        ConfigSri {
            esperas_recepcion: vec![Duration::ZERO],
            esperas_autorizacion: vec![Duration::ZERO; intentos_autorizacion.max(1)],
            ..ConfigSri::default()
        }
    }
}

fn parsear_esperas(clave: &str, valor: &str) -> Result<Vec<Duration>, ErrorSri> {
    let esperas = valor
        .split(',')
        .map(|s| s.trim().parse::<u64>().map(Duration::from_secs))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| ErrorSri::Configuracion(format!("{} invalido: '{}'", clave, valor)))?;
    if esperas.is_empty() {
        return Err(ErrorSri::Configuracion(format!("{} no puede estar vacio", clave)));
    }
    Ok(esperas)
}

fn segundos(valores: &[u64]) -> Vec<Duration> {
    valores.iter().map(|s| Duration::from_secs(*s)).collect()
}

pub(crate) fn solo_digitos(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}
