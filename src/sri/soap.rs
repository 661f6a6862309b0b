use crate::config::{Ambiente, ConfigSri};
use crate::error::ErrorSri;
use crate::sri::clave_acceso::ClaveAcceso;
use crate::sri::respuesta::{
    parsear_respuesta_autorizacion, parsear_respuesta_recepcion, ResultadoAutorizacion,
    ResultadoRecepcion,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, info, warn};

/// Endpoints del SRI
const RECEPCION_PRUEBAS: &str = "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline";
const RECEPCION_PRODUCCION: &str = "https://cel.sri.gob.ec/comprobantes-electronicos-ws/RecepcionComprobantesOffline";
const AUTORIZACION_PRUEBAS: &str = "https://celcer.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline";
const AUTORIZACION_PRODUCCION: &str = "https://cel.sri.gob.ec/comprobantes-electronicos-ws/AutorizacionComprobantesOffline";

/// Obtiene la URL de recepcion segun el ambiente
pub fn url_recepcion(ambiente: Ambiente) -> &'static str {
    match ambiente {
        Ambiente::Produccion => RECEPCION_PRODUCCION,
        Ambiente::Pruebas => RECEPCION_PRUEBAS,
    }
}

/// Obtiene la URL de autorizacion segun el ambiente
pub fn url_autorizacion(ambiente: Ambiente) -> &'static str {
    match ambiente {
        Ambiente::Produccion => AUTORIZACION_PRODUCCION,
        Ambiente::Pruebas => AUTORIZACION_PRUEBAS,
    }
}

/// Puerto hacia los web services del SRI.
///
/// Cada llamada es un solo intento; los reintentos y el sondeo los maneja
/// el orquestador.
#[async_trait]
pub trait ClienteAutoridad: Send + Sync {
    /// `validarComprobante`: envia el XML firmado
    async fn enviar_comprobante(
        &self,
        xml_firmado: &str,
        ambiente: Ambiente,
    ) -> Result<ResultadoRecepcion, ErrorSri>;

    /// `autorizacionComprobante`: consulta por clave de acceso
    async fn consultar_autorizacion(
        &self,
        clave: &ClaveAcceso,
        ambiente: Ambiente,
    ) -> Result<ResultadoAutorizacion, ErrorSri>;
}

/// Cliente SOAP 1.1 sobre reqwest
pub struct ClienteSoap {
    client: reqwest::Client,
    /// Solo existe si se habilito `sri_tls_permisivo_pruebas`
    client_pruebas: Option<reqwest::Client>,
}

impl ClienteSoap {
    pub fn nuevo(config: &ConfigSri) -> Result<Self, ErrorSri> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout_http)
            .build()
            .map_err(|e| ErrorSri::Configuracion(format!("Error creando cliente HTTP: {}", e)))?;

        let client_pruebas = if config.tls_permisivo_pruebas {
            warn!("TLS permisivo habilitado para el ambiente de pruebas");
            Some(
                reqwest::Client::builder()
                    .danger_accept_invalid_certs(true) // Solo en pruebas
                    .timeout(config.timeout_http)
                    .build()
                    .map_err(|e| {
                        ErrorSri::Configuracion(format!("Error creando cliente HTTP: {}", e))
                    })?,
            )
        } else {
            None
        };

        Ok(ClienteSoap {
            client,
            client_pruebas,
        })
    }

    fn client_para(&self, ambiente: Ambiente) -> &reqwest::Client {
        match (ambiente, &self.client_pruebas) {
            (Ambiente::Pruebas, Some(permisivo)) => permisivo,
            _ => &self.client,
        }
    }

    async fn post(&self, url: &str, ambiente: Ambiente, envelope: String) -> Result<String, ErrorSri> {
        let resp = self
            .client_para(ambiente)
            .post(url)
            .header("Content-Type", "text/xml; charset=utf-8")
            .body(envelope)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        debug!(%status, url, "Respuesta SRI:\n{}", body);

        // 502/503/504 de un proxy: sin sobre SOAP, se puede reintentar
        if status.is_server_error() && !body.contains("Envelope") {
            return Err(ErrorSri::Red(format!("HTTP {} desde {}", status, url)));
        }
        Ok(body)
    }
}

#[async_trait]
impl ClienteAutoridad for ClienteSoap {
    async fn enviar_comprobante(
        &self,
        xml_firmado: &str,
        ambiente: Ambiente,
    ) -> Result<ResultadoRecepcion, ErrorSri> {
        let url = url_recepcion(ambiente);
        info!(url, bytes = xml_firmado.len(), "Enviando a recepcion");
        let body = self
            .post(url, ambiente, sobre_recepcion(xml_firmado))
            .await?;
        parsear_respuesta_recepcion(&body)
    }

    async fn consultar_autorizacion(
        &self,
        clave: &ClaveAcceso,
        ambiente: Ambiente,
    ) -> Result<ResultadoAutorizacion, ErrorSri> {
        let url = url_autorizacion(ambiente);
        debug!(url, clave_acceso = %clave, "Consultando autorizacion");
        let body = self
            .post(url, ambiente, sobre_autorizacion(clave))
            .await?;
        parsear_respuesta_autorizacion(&body)
    }
}

/// Sobre SOAP de `validarComprobante` con el XML en base64
pub fn sobre_recepcion(xml_firmado: &str) -> String {
    let xml_base64 = BASE64.encode(xml_firmado.as_bytes());
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ec="http://ec.gob.sri.ws.recepcion"><soapenv:Header></soapenv:Header><soapenv:Body><ec:validarComprobante><xml>{}</xml></ec:validarComprobante></soapenv:Body></soapenv:Envelope>"#,
        xml_base64
    )
}

/// Sobre SOAP de `autorizacionComprobante`
pub fn sobre_autorizacion(clave: &ClaveAcceso) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:ec="http://ec.gob.sri.ws.autorizacion"><soapenv:Header></soapenv:Header><soapenv:Body><ec:autorizacionComprobante><claveAccesoComprobante>{}</claveAccesoComprobante></ec:autorizacionComprobante></soapenv:Body></soapenv:Envelope>"#,
        clave
    )
}
