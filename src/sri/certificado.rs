//! Almacen de certificados: lectura de la firma electronica (.p12) del emisor.
//!
//! La llave privada nunca sale de este modulo sin envolver. `Certificado`
//! guarda los bytes PKCS#8 en un buffer que se borra al soltarlo, y solo
//! `con_llave` la decodifica, por el tiempo de una firma.
use crate::error::ErrorSri;
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use x509_parser::objects::{oid2abbrev, oid_registry};
use x509_parser::prelude::FromDer;
use x509_parser::x509::X509Name;
use zeroize::Zeroizing;

/// Identidad de firma cargada desde el P12
pub struct Certificado {
    llave_pkcs8: Zeroizing<Vec<u8>>,
    certificado_der: Vec<u8>,
    info: InfoCertificado,
}

/// Metadatos publicos del certificado (lo que se muestra al usuario)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoCertificado {
    pub sujeto: String,
    /// Nombre del emisor en orden RFC 2253 (CN primero)
    pub emisor: String,
    /// Numero de serie en decimal, como lo pide X509SerialNumber
    pub serial: String,
    pub valido_desde: DateTime<Utc>,
    pub valido_hasta: DateTime<Utc>,
}

impl fmt::Debug for Certificado {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificado")
            .field("info", &self.info)
            .field("llave_pkcs8", &"<redactada>")
            .finish()
    }
}

impl Certificado {
    pub fn info(&self) -> &InfoCertificado {
        &self.info
    }

    pub fn certificado_der(&self) -> &[u8] {
        &self.certificado_der
    }

    /// El certificado cubre el instante dado
    pub fn vigente_en(&self, momento: DateTime<Utc>) -> bool {
        self.info.valido_desde <= momento && momento <= self.info.valido_hasta
    }

    /// Falla con `Certificado` si el certificado no esta vigente en `momento`
    pub fn verificar_vigencia(&self, momento: DateTime<Utc>) -> Result<(), ErrorSri> {
        if self.vigente_en(momento) {
            return Ok(());
        }
        Err(ErrorSri::Certificado(format!(
            "El certificado no esta vigente ({} a {})",
            self.info.valido_desde.format("%Y-%m-%d"),
            self.info.valido_hasta.format("%Y-%m-%d")
        )))
    }

    /// Decodifica la llave RSA solo durante `f`. La llave se descarta al salir.
    pub fn con_llave<T>(
        &self,
        f: impl FnOnce(&RsaPrivateKey) -> Result<T, ErrorSri>,
    ) -> Result<T, ErrorSri> {
        let llave = RsaPrivateKey::from_pkcs8_der(&self.llave_pkcs8)
            .map_err(|e| ErrorSri::Cripto(format!("No se pudo decodificar la llave privada: {}", e)))?;
        f(&llave)
    }
}

/// Lee el P12 y retorna el certificado con su llave.
///
/// Falla con `Certificado` si la contrasena es incorrecta, el contenedor esta
/// corrupto, no hay par llave/certificado o la llave no es RSA.
pub fn cargar(p12_data: &[u8], password: &str) -> Result<Certificado, ErrorSri> {
    // 1. Abrir el contenedor
    let keystore = p12_keystore::KeyStore::from_pkcs12(p12_data, password)
        .map_err(|e| ErrorSri::Certificado(format!("Password incorrecta o P12 invalido: {}", e)))?;

    // 2. Par llave privada + cadena
    let (alias, chain) = keystore.private_key_chain().ok_or_else(|| {
        ErrorSri::Certificado("El P12 no contiene llave privada y certificado".to_string())
    })?;

    let certificado_der = chain
        .chain()
        .first()
        .map(|c| c.as_der().to_vec())
        .ok_or_else(|| ErrorSri::Certificado("El P12 no contiene un certificado X509".to_string()))?;

    let llave_pkcs8 = Zeroizing::new(chain.key().to_vec());

    // 3. La llave debe ser RSA (la firma del SRI es RSA-SHA256)
    RsaPrivateKey::from_pkcs8_der(&llave_pkcs8)
        .map_err(|_| ErrorSri::Certificado("La llave privada del P12 no es RSA".to_string()))?;

    // 4. Metadatos del certificado
    let info = leer_info(&certificado_der)?;
    debug!(alias, emisor = %info.emisor, serial = %info.serial, "P12 leido");

    Ok(Certificado {
        llave_pkcs8,
        certificado_der,
        info,
    })
}

/// Valida el P12 y retorna solo sus metadatos; la llave se descarta.
pub fn validar(p12_data: &[u8], password: &str) -> Result<InfoCertificado, ErrorSri> {
    let certificado = cargar(p12_data, password)?;
    info!(
        sujeto = %certificado.info.sujeto,
        hasta = %certificado.info.valido_hasta,
        "Certificado validado"
    );
    Ok(certificado.info.clone())
}

fn leer_info(der: &[u8]) -> Result<InfoCertificado, ErrorSri> {
    let (_, x509) = x509_parser::certificate::X509Certificate::from_der(der)
        .map_err(|e| ErrorSri::Certificado(format!("Error parseando certificado: {:?}", e)))?;

    let validez = x509.validity();
    let valido_desde = fecha_desde_timestamp(validez.not_before.timestamp())?;
    let valido_hasta = fecha_desde_timestamp(validez.not_after.timestamp())?;

    Ok(InfoCertificado {
        sujeto: nombre_rfc2253(x509.subject()),
        emisor: nombre_rfc2253(x509.issuer()),
        serial: serial_decimal(x509.raw_serial()),
        valido_desde,
        valido_hasta,
    })
}

fn fecha_desde_timestamp(ts: i64) -> Result<DateTime<Utc>, ErrorSri> {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .ok_or_else(|| ErrorSri::Certificado(format!("Fecha de validez fuera de rango: {}", ts)))
}

/// Nombre en el formato de X509IssuerName ("CN=...,O=...,C=EC"): los RDN
/// van en orden inverso al DER y cada valor se escapa segun RFC 2253.
fn nombre_rfc2253(nombre: &X509Name<'_>) -> String {
    nombre
        .iter_rdn()
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(|rdn| {
            rdn.iter()
                .map(|atributo| {
                    let tipo = oid2abbrev(atributo.attr_type(), oid_registry())
                        .map(|abreviado| abreviado.to_string())
                        .unwrap_or_else(|_| atributo.attr_type().to_id_string());
                    let valor = match atributo.as_str() {
                        Ok(texto) => escapar_valor_dn(texto),
                        // Valores que no son texto van en hexadecimal
                        Err(_) => format!(
                            "#{}",
                            atributo
                                .attr_value()
                                .as_bytes()
                                .iter()
                                .map(|b| format!("{:02X}", b))
                                .collect::<String>()
                        ),
                    };
                    format!("{}={}", tipo, valor)
                })
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn escapar_valor_dn(valor: &str) -> String {
    let ultimo = valor.chars().count().saturating_sub(1);
    let mut salida = String::with_capacity(valor.len());
    for (i, c) in valor.chars().enumerate() {
        match c {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' => {
                salida.push('\\');
                salida.push(c);
            }
            '#' if i == 0 => salida.push_str("\\#"),
            ' ' if i == 0 || i == ultimo => salida.push_str("\\ "),
            _ => salida.push(c),
        }
    }
    salida
}

/// Numero de serie big-endian a decimal
fn serial_decimal(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "0".to_string();
    }

    let mut digits: Vec<u8> = vec![0];
    for &byte in bytes {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 10) as u8;
            carry = value / 10;
        }
        while carry > 0 {
            digits.push((carry % 10) as u8);
            carry /= 10;
        }
    }

    while digits.len() > 1 && matches!(digits.last(), Some(0)) {
        digits.pop();
    }

    digits.iter().rev().map(|d| (b'0' + *d) as char).collect()
}
