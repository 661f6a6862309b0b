use async_trait::async_trait;
use chrono::NaiveDate;
use clouget_sri::config::{Ambiente, ConfigSri};
use clouget_sri::db::Database;
use clouget_sri::emision::repositorio::{MensajeGuardado, NuevoComprobante, RepositorioComprobantes};
use clouget_sri::emision::{
    canal, ContadorSecuencial, ContadorSqlite, CredencialFirma, Orquestador, SenalCancelacion,
};
use clouget_sri::models::{
    BorradorFactura, BorradorNotaCredito, Comprador, EstadoComprobante, TipoComprobante,
    TipoIdentificacion, Totales,
};
use clouget_sri::sri::clave_acceso::{generar_clave_acceso, ClaveAcceso, EMISION_NORMAL};
use clouget_sri::sri::respuesta::{
    EstadoAutorizacion, EstadoRecepcion, MensajeSri, ResultadoAutorizacion, ResultadoRecepcion,
};
use clouget_sri::sri::soap::ClienteAutoridad;
use clouget_sri::sri::xml::{DetalleFactura, PagoFactura};
use clouget_sri::ErrorSri;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const P12_PRUEBA: &[u8] = include_bytes!("fixtures/certificado_prueba.p12");
const P12_EXPIRADO: &[u8] = include_bytes!("fixtures/certificado_expirado.p12");
const TENANT: &str = "restaurante-centro";

/// SRI simulado: responde lo encolado y, con las colas vacias, RECIBIDA y AUTORIZADO.
#[derive(Default)]
struct SriFalso {
    recepciones: Mutex<VecDeque<Result<ResultadoRecepcion, ErrorSri>>>,
    autorizaciones: Mutex<VecDeque<Result<ResultadoAutorizacion, ErrorSri>>>,
    enviados: Mutex<Vec<String>>,
    consultas: Mutex<usize>,
}

impl SriFalso {
    fn encolar_recepcion(&self, respuesta: Result<ResultadoRecepcion, ErrorSri>) {
        self.recepciones.lock().unwrap().push_back(respuesta);
    }

    fn encolar_autorizacion(&self, respuesta: Result<ResultadoAutorizacion, ErrorSri>) {
        self.autorizaciones.lock().unwrap().push_back(respuesta);
    }

    fn enviados(&self) -> Vec<String> {
        self.enviados.lock().unwrap().clone()
    }

    fn consultas(&self) -> usize {
        *self.consultas.lock().unwrap()
    }
}

#[async_trait]
impl ClienteAutoridad for SriFalso {
    async fn enviar_comprobante(
        &self,
        xml_firmado: &str,
        _ambiente: Ambiente,
    ) -> Result<ResultadoRecepcion, ErrorSri> {
        self.enviados.lock().unwrap().push(xml_firmado.to_string());
        self.recepciones.lock().unwrap().pop_front().unwrap_or(Ok(ResultadoRecepcion {
            estado: EstadoRecepcion::Recibida,
            clave_acceso: None,
            mensajes: Vec::new(),
        }))
    }

    async fn consultar_autorizacion(
        &self,
        clave: &ClaveAcceso,
        ambiente: Ambiente,
    ) -> Result<ResultadoAutorizacion, ErrorSri> {
        *self.consultas.lock().unwrap() += 1;
        self.autorizaciones.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(ResultadoAutorizacion {
                estado: EstadoAutorizacion::Autorizado,
                clave_acceso: Some(clave.to_string()),
                numero_autorizacion: Some(clave.to_string()),
                fecha_autorizacion: Some("2026-02-11T10:31:05-05:00".to_string()),
                ambiente: Some(ambiente.as_str().to_string()),
                comprobante: None,
                mensajes: Vec::new(),
            })
        })
    }
}

fn mensaje(id: &str, texto: &str) -> MensajeSri {
    MensajeSri {
        identificador: id.to_string(),
        mensaje: texto.to_string(),
        informacion_adicional: None,
        tipo: "ERROR".to_string(),
    }
}

fn db_configurada() -> Arc<Database> {
    let db = Database::en_memoria().unwrap();
    for (key, value) in [
        ("ruc", "0912345678001"),
        ("razon_social", "RESTAURANTE DE PRUEBA S.A."),
        ("direccion", "Av. 9 de Octubre 100, Guayaquil"),
        ("sri_ambiente", "pruebas"),
        ("establecimiento", "001"),
        ("punto_emision", "001"),
    ] {
        db.guardar_config(TENANT, key, value).unwrap();
    }
    Arc::new(db)
}

fn orquestador(config: ConfigSri) -> (Orquestador<SriFalso>, Arc<SriFalso>, Arc<Database>) {
    let db = db_configurada();
    let sri = Arc::new(SriFalso::default());
    let orq = Orquestador::nuevo(Arc::clone(&db), Arc::clone(&sri), config);
    (orq, sri, db)
}

fn credencial() -> CredencialFirma {
    CredencialFirma::nueva(P12_PRUEBA.to_vec(), "clave-prueba")
}

fn fecha() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 2, 11).unwrap()
}

fn detalles() -> Vec<DetalleFactura> {
    vec![
        DetalleFactura::nuevo("SEC-01", "Seco de pollo", 2.0, 5.00, 0.0, "2").unwrap(),
        DetalleFactura::nuevo("JUG-01", "Jugo de naranjilla", 1.0, 2.50, 0.0, "2").unwrap(),
        DetalleFactura::nuevo("AGU-01", "Agua sin gas", 3.0, 1.00, 0.0, "0").unwrap(),
    ]
}

/// 15.50 de base + 1.50 de IVA 12% + 1.55 de propina
fn borrador() -> BorradorFactura {
    BorradorFactura {
        fecha_emision: fecha(),
        comprador: Comprador::consumidor_final(),
        detalles: detalles(),
        pagos: vec![PagoFactura::nuevo("01", 18.55)],
        totales: Totales {
            total_sin_impuestos: 15.50,
            total_descuento: 0.0,
            propina: 1.55,
            importe_total: 18.55,
        },
    }
}

fn borrador_sin_propina() -> BorradorFactura {
    let mut borrador = borrador();
    borrador.totales.propina = 0.0;
    borrador.totales.importe_total = 17.00;
    borrador.pagos = vec![PagoFactura::nuevo("19", 17.00)];
    borrador
}

fn nota_credito(factura: &ClaveAcceso, detalles: Vec<DetalleFactura>) -> BorradorNotaCredito {
    BorradorNotaCredito {
        fecha_emision: fecha(),
        factura: factura.clone(),
        comprador: Comprador {
            tipo_identificacion: TipoIdentificacion::Cedula,
            identificacion: "0912345678".to_string(),
            razon_social: "Maria Perez".to_string(),
            direccion: None,
            email: Some("maria@example.com".to_string()),
            telefono: None,
        },
        motivo: "Devolucion del pedido".to_string(),
        detalles,
    }
}

fn estados(orq: &Orquestador<SriFalso>, clave: &ClaveAcceso) -> Vec<EstadoComprobante> {
    orq.historial(TENANT, clave)
        .unwrap()
        .into_iter()
        .map(|t| t.hacia)
        .collect()
}

#[tokio::test]
async fn test_factura_autorizada_recorre_todo_el_ciclo() {
    let (orq, sri, _db) = orquestador(ConfigSri::sin_esperas(3));

    let resultado = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();

    assert!(resultado.autorizado());
    assert_eq!(resultado.numero, "001-001-000000001");
    assert_eq!(resultado.numero_autorizacion.as_deref(), Some(resultado.clave_acceso.as_str()));
    assert_eq!(resultado.clave_acceso.cod_doc(), "01");
    assert_eq!(resultado.clave_acceso.fecha_emision(), fecha());

    assert_eq!(
        estados(&orq, &resultado.clave_acceso),
        vec![
            EstadoComprobante::Borrador,
            EstadoComprobante::XmlGenerado,
            EstadoComprobante::Firmado,
            EstadoComprobante::Enviado,
            EstadoComprobante::Recibido,
            EstadoComprobante::Autorizado,
        ]
    );

    // Lo enviado es exactamente lo que quedo guardado
    let xml = orq.obtener_xml_firmado(TENANT, &resultado.clave_acceso).unwrap();
    assert_eq!(sri.enviados(), vec![xml.clone()]);

    // Dos grupos de IVA: 12% y 0%
    assert_eq!(xml.matches("<totalImpuesto>").count(), 2);
    assert!(xml.contains("<baseImponible>12.50</baseImponible>"));
    assert!(xml.contains("<valor>1.50</valor>"));
    assert!(xml.contains("<propina>1.55</propina>"));
    assert!(xml.contains("<importeTotal>18.55</importeTotal>"));
    assert!(xml.contains(&format!("<claveAcceso>{}</claveAcceso>", resultado.clave_acceso)));

    let json = serde_json::to_value(&resultado).unwrap();
    assert_eq!(json["numero"], "001-001-000000001");
}

#[tokio::test]
async fn test_secuenciales_consecutivos() {
    let (orq, _sri, _db) = orquestador(ConfigSri::sin_esperas(1));

    let primera = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();
    let segunda = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();

    assert_eq!(primera.numero, "001-001-000000001");
    assert_eq!(segunda.numero, "001-001-000000002");
    assert_eq!(segunda.clave_acceso.secuencial(), "000000002");
    assert_ne!(primera.clave_acceso, segunda.clave_acceso);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_emisiones_concurrentes_no_repiten_numero() {
    let (orq, _sri, _db) = orquestador(ConfigSri::sin_esperas(1));
    let orq = Arc::new(orq);
    let credencial = Arc::new(credencial());

    let mut tareas = Vec::new();
    for _ in 0..6 {
        let orq = Arc::clone(&orq);
        let credencial = Arc::clone(&credencial);
        tareas.push(tokio::spawn(async move {
            orq.emitir_factura(TENANT, &borrador(), &credencial, SenalCancelacion::nunca())
                .await
                .unwrap()
                .numero
        }));
    }

    let mut numeros = Vec::new();
    for tarea in tareas {
        numeros.push(tarea.await.unwrap());
    }
    numeros.sort();
    numeros.dedup();
    assert_eq!(numeros.len(), 6);
    assert_eq!(numeros.last().map(String::as_str), Some("001-001-000000006"));
}

#[tokio::test]
async fn test_devuelta_es_terminal() {
    let (orq, sri, _db) = orquestador(ConfigSri::sin_esperas(3));
    sri.encolar_recepcion(Ok(ResultadoRecepcion {
        estado: EstadoRecepcion::Devuelta,
        clave_acceso: None,
        mensajes: vec![mensaje("35", "ARCHIVO NO CUMPLE ESTRUCTURA XML")],
    }));

    let err = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap_err();
    match err {
        ErrorSri::RechazoSri { ref estado, ref mensajes } => {
            assert_eq!(estado, "DEVUELTA");
            assert_eq!(mensajes[0].identificador, "35");
        }
        otro => panic!("se esperaba RechazoSri, llego {:?}", otro),
    }
    assert_eq!(sri.consultas(), 0);

    // El comprobante queda DEVUELTO con el mensaje guardado
    let clave = clave_enviada(&sri, 0);
    let comprobante = orq.consultar(TENANT, &clave).unwrap();
    assert_eq!(comprobante.estado, EstadoComprobante::Devuelto);

    let guardados = orq.repositorio().mensajes(comprobante.id).unwrap();
    assert_eq!(
        guardados,
        vec![MensajeGuardado {
            etapa: "RECEPCION".to_string(),
            mensaje: mensaje("35", "ARCHIVO NO CUMPLE ESTRUCTURA XML"),
        }]
    );

    // Reanudar no reenvia un comprobante devuelto
    let err = orq
        .reanudar(TENANT, &clave, SenalCancelacion::nunca())
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::RechazoSri { .. }));
    assert_eq!(sri.enviados().len(), 1);
}

#[tokio::test]
async fn test_error_70_pasa_a_consultar_autorizacion() {
    let (orq, sri, _db) = orquestador(ConfigSri::sin_esperas(3));
    sri.encolar_recepcion(Ok(ResultadoRecepcion {
        estado: EstadoRecepcion::Devuelta,
        clave_acceso: None,
        mensajes: vec![mensaje("70", "CLAVE DE ACCESO EN PROCESAMIENTO")],
    }));

    let resultado = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();

    assert!(resultado.autorizado());
    let historial = orq.historial(TENANT, &resultado.clave_acceso).unwrap();
    let recibido = historial
        .iter()
        .find(|t| t.hacia == EstadoComprobante::Recibido)
        .unwrap();
    assert!(recibido.detalle.as_deref().unwrap_or("").contains("70"));
}

#[tokio::test]
async fn test_no_autorizado_guarda_mensajes() {
    let (orq, sri, _db) = orquestador(ConfigSri::sin_esperas(3));
    sri.encolar_autorizacion(Ok(ResultadoAutorizacion {
        estado: EstadoAutorizacion::NoAutorizado,
        clave_acceso: None,
        numero_autorizacion: None,
        fecha_autorizacion: None,
        ambiente: None,
        comprobante: None,
        mensajes: vec![mensaje("39", "FIRMA INVALIDA")],
    }));

    let err = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::RechazoSri { ref estado, .. } if estado == "NO AUTORIZADO"));
    assert_eq!(sri.consultas(), 1);

    let comprobante = orq
        .repositorio()
        .buscar_por_clave(TENANT, &clave_enviada(&sri, 0))
        .unwrap()
        .unwrap();
    assert_eq!(comprobante.estado, EstadoComprobante::NoAutorizado);
    let guardados = orq.repositorio().mensajes(comprobante.id).unwrap();
    assert!(guardados
        .iter()
        .any(|m| m.etapa == "AUTORIZACION" && m.mensaje.identificador == "39"));
}

#[tokio::test]
async fn test_autorizacion_de_otra_clave_no_se_registra() {
    let (orq, sri, _db) = orquestador(ConfigSri::sin_esperas(3));
    sri.encolar_autorizacion(Ok(ResultadoAutorizacion {
        estado: EstadoAutorizacion::Autorizado,
        clave_acceso: Some("1102202601179999999900110010010000000011234567819".to_string()),
        numero_autorizacion: Some("1102202601179999999900110010010000000011234567819".to_string()),
        fecha_autorizacion: Some("2026-02-11T10:31:05-05:00".to_string()),
        ambiente: Some("PRUEBAS".to_string()),
        comprobante: None,
        mensajes: Vec::new(),
    }));

    let err = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::Protocolo(_)));
    assert_eq!(sri.consultas(), 1);

    // Sigue RECIBIDO, sin numero de autorizacion
    let clave = clave_enviada(&sri, 0);
    let comprobante = orq.consultar(TENANT, &clave).unwrap();
    assert_eq!(comprobante.estado, EstadoComprobante::Recibido);
    assert!(comprobante.numero_autorizacion.is_none());

    // La siguiente consulta trae la clave correcta
    let resultado = orq
        .reanudar(TENANT, &clave, SenalCancelacion::nunca())
        .await
        .unwrap();
    assert!(resultado.autorizado());
    assert_eq!(resultado.numero_autorizacion.as_deref(), Some(clave.as_str()));
}

fn clave_enviada(sri: &SriFalso, i: usize) -> ClaveAcceso {
    sri.enviados()[i]
        .split("<claveAcceso>")
        .nth(1)
        .and_then(|resto| resto.split("</claveAcceso>").next())
        .unwrap()
        .parse()
        .unwrap()
}

#[tokio::test]
async fn test_sondeo_agotado_queda_recibido_y_se_reanuda_con_la_misma_clave() {
    let (orq, sri, _db) = orquestador(ConfigSri::sin_esperas(3));
    for _ in 0..3 {
        sri.encolar_autorizacion(Ok(ResultadoAutorizacion::en_proceso()));
    }

    let pendiente = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();
    assert!(pendiente.en_proceso());
    assert!(!pendiente.autorizado());
    assert_eq!(sri.consultas(), 3);
    assert_eq!(
        orq.consultar(TENANT, &pendiente.clave_acceso).unwrap().estado,
        EstadoComprobante::Recibido
    );

    let resultado = orq
        .reanudar(TENANT, &pendiente.clave_acceso, SenalCancelacion::nunca())
        .await
        .unwrap();
    assert!(resultado.autorizado());
    assert_eq!(resultado.clave_acceso, pendiente.clave_acceso);
    // RECIBIDO solo consulta, no reenvia
    assert_eq!(sri.enviados().len(), 1);

    // Reanudar un autorizado solo retorna el resultado
    let otra_vez = orq
        .reanudar(TENANT, &pendiente.clave_acceso, SenalCancelacion::nunca())
        .await
        .unwrap();
    assert!(otra_vez.autorizado());
    assert_eq!(sri.consultas(), 4);
}

#[tokio::test]
async fn test_falla_de_red_deja_enviado_y_reanudar_reenvia_el_mismo_xml() {
    let (orq, sri, _db) = orquestador(ConfigSri::sin_esperas(2));
    sri.encolar_recepcion(Err(ErrorSri::Red("connection reset".to_string())));

    let err = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::Red(_)));
    assert!(err.es_reintentable());

    let clave = clave_enviada(&sri, 0);
    assert_eq!(orq.consultar(TENANT, &clave).unwrap().estado, EstadoComprobante::Enviado);

    let resultado = orq
        .reanudar(TENANT, &clave, SenalCancelacion::nunca())
        .await
        .unwrap();
    assert!(resultado.autorizado());

    let enviados = sri.enviados();
    assert_eq!(enviados.len(), 2);
    assert_eq!(enviados[0], enviados[1]);
}

#[tokio::test]
async fn test_reintenta_recepcion_ante_falla_de_red() {
    let mut config = ConfigSri::sin_esperas(2);
    config.esperas_recepcion = vec![Duration::ZERO; 3];
    let (orq, sri, _db) = orquestador(config);
    sri.encolar_recepcion(Err(ErrorSri::Red("timeout".to_string())));
    sri.encolar_recepcion(Err(ErrorSri::Red("timeout".to_string())));

    let resultado = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();
    assert!(resultado.autorizado());
    assert_eq!(sri.enviados().len(), 3);
}

#[tokio::test]
async fn test_nota_credito_total_anula_la_factura() {
    let (orq, _sri, _db) = orquestador(ConfigSri::sin_esperas(2));
    let factura = orq
        .emitir_factura(TENANT, &borrador_sin_propina(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();

    let nota = orq
        .emitir_nota_credito(
            TENANT,
            &nota_credito(&factura.clave_acceso, detalles()),
            &credencial(),
            SenalCancelacion::nunca(),
        )
        .await
        .unwrap();

    assert!(nota.autorizado());
    assert_eq!(nota.clave_acceso.cod_doc(), "04");
    // Las notas de credito llevan su propia serie
    assert_eq!(nota.numero, "001-001-000000001");

    let xml = orq.obtener_xml_firmado(TENANT, &nota.clave_acceso).unwrap();
    assert!(xml.contains("<numDocModificado>001-001-000000001</numDocModificado>"));
    assert!(xml.contains("<valorModificacion>17.00</valorModificacion>"));

    let factura_actual = orq.consultar(TENANT, &factura.clave_acceso).unwrap();
    assert_eq!(factura_actual.estado, EstadoComprobante::Anulado);
    assert_eq!(
        estados(&orq, &factura.clave_acceso).last(),
        Some(&EstadoComprobante::Anulado)
    );

    // Una factura anulada no admite otra nota de credito
    let err = orq
        .emitir_nota_credito(
            TENANT,
            &nota_credito(&factura.clave_acceso, detalles()),
            &credencial(),
            SenalCancelacion::nunca(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::Validacion(_)));
}

#[tokio::test]
async fn test_nota_credito_parcial_no_anula() {
    let (orq, _sri, _db) = orquestador(ConfigSri::sin_esperas(2));
    let factura = orq
        .emitir_factura(TENANT, &borrador_sin_propina(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();

    let parcial = vec![DetalleFactura::nuevo("SEC-01", "Seco de pollo", 2.0, 5.00, 0.0, "2").unwrap()];
    let nota = orq
        .emitir_nota_credito(
            TENANT,
            &nota_credito(&factura.clave_acceso, parcial),
            &credencial(),
            SenalCancelacion::nunca(),
        )
        .await
        .unwrap();
    assert!(nota.autorizado());

    let factura_actual = orq.consultar(TENANT, &factura.clave_acceso).unwrap();
    assert_eq!(factura_actual.estado, EstadoComprobante::Autorizado);

    // Quedan 5.80 de saldo; devolver todo otra vez lo supera
    let err = orq
        .emitir_nota_credito(
            TENANT,
            &nota_credito(&factura.clave_acceso, detalles()),
            &credencial(),
            SenalCancelacion::nunca(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::Validacion(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_notas_credito_simultaneas_no_superan_la_factura() {
    let (orq, _sri, _db) = orquestador(ConfigSri::sin_esperas(2));
    let orq = Arc::new(orq);
    let factura = orq
        .emitir_factura(TENANT, &borrador_sin_propina(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();

    let mut tareas = Vec::new();
    for _ in 0..2 {
        let orq = Arc::clone(&orq);
        let nota = nota_credito(&factura.clave_acceso, detalles());
        tareas.push(tokio::spawn(async move {
            orq.emitir_nota_credito(TENANT, &nota, &credencial(), SenalCancelacion::nunca())
                .await
        }));
    }

    let mut autorizadas = 0;
    for tarea in tareas {
        match tarea.await.unwrap() {
            Ok(nota) => {
                assert!(nota.autorizado());
                autorizadas += 1;
            }
            Err(ErrorSri::Validacion(_)) => {}
            Err(otro) => panic!("se esperaba Validacion, llego {:?}", otro),
        }
    }
    assert_eq!(autorizadas, 1);

    let notas = orq
        .repositorio()
        .notas_de_factura(TENANT, &factura.clave_acceso)
        .unwrap();
    assert_eq!(notas.len(), 1);
    assert_eq!(
        orq.consultar(TENANT, &factura.clave_acceso).unwrap().estado,
        EstadoComprobante::Anulado
    );
}

/// Contador que, justo antes de numerar, deja registrada la nota de credito
/// de otra emision sobre la misma factura.
struct ContadorConNotaIntercalada {
    interno: ContadorSqlite,
    repo: RepositorioComprobantes,
    nota: Mutex<Option<NuevoComprobante>>,
}

impl ContadorSecuencial for ContadorConNotaIntercalada {
    fn siguiente(
        &self,
        tenant: &str,
        establecimiento: &str,
        punto_emision: &str,
        tipo: TipoComprobante,
    ) -> Result<u64, ErrorSri> {
        if let Some(nota) = self.nota.lock().unwrap().take() {
            self.repo.crear(&nota)?;
        }
        self.interno.siguiente(tenant, establecimiento, punto_emision, tipo)
    }

    fn registrar_hueco(
        &self,
        tenant: &str,
        establecimiento: &str,
        punto_emision: &str,
        tipo: TipoComprobante,
        secuencial: u64,
        motivo: &str,
    ) -> Result<(), ErrorSri> {
        self.interno
            .registrar_hueco(tenant, establecimiento, punto_emision, tipo, secuencial, motivo)
    }
}

#[tokio::test]
async fn test_saldo_consumido_al_numerar_deja_hueco_registrado() {
    let db = db_configurada();
    let sri = Arc::new(SriFalso::default());
    let contador = Arc::new(ContadorConNotaIntercalada {
        interno: ContadorSqlite::nuevo(Arc::clone(&db)),
        repo: RepositorioComprobantes::nuevo(Arc::clone(&db)),
        nota: Mutex::new(None),
    });
    let orq = Orquestador::nuevo(Arc::clone(&db), Arc::clone(&sri), ConfigSri::sin_esperas(2))
        .con_contador(contador.clone());

    let factura = orq
        .emitir_factura(TENANT, &borrador_sin_propina(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();

    // Otra emision toma el saldo completo mientras esta se numera
    let intercalada = generar_clave_acceso(
        fecha(),
        TipoComprobante::NotaCredito,
        "0912345678001",
        Ambiente::Pruebas,
        "001",
        "001",
        900,
        11111111,
        EMISION_NORMAL,
    )
    .unwrap();
    *contador.nota.lock().unwrap() = Some(NuevoComprobante {
        tenant: TENANT.to_string(),
        tipo: TipoComprobante::NotaCredito,
        clave_acceso: intercalada,
        numero: "001-001-000000900".to_string(),
        fecha_emision: fecha(),
        importe_total: 17.00,
        documento_modificado: Some(factura.clave_acceso.clone()),
    });

    let err = orq
        .emitir_nota_credito(
            TENANT,
            &nota_credito(&factura.clave_acceso, detalles()),
            &credencial(),
            SenalCancelacion::nunca(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::Validacion(_)));

    // Solo la factura llego al SRI y sigue AUTORIZADA
    assert_eq!(sri.enviados().len(), 1);
    assert_eq!(
        orq.consultar(TENANT, &factura.clave_acceso).unwrap().estado,
        EstadoComprobante::Autorizado
    );

    // El numero asignado queda como hueco de la serie de notas de credito
    let huecos = ContadorSqlite::nuevo(Arc::clone(&db)).huecos(TENANT).unwrap();
    assert_eq!(huecos.len(), 1);
    assert_eq!(huecos[0].cod_doc, "04");
    assert_eq!(huecos[0].secuencial, 1);
    assert!(huecos[0].motivo.contains("supera el saldo"));
}

#[tokio::test]
async fn test_nota_credito_requiere_factura_autorizada() {
    let (orq, sri, _db) = orquestador(ConfigSri::sin_esperas(2));
    sri.encolar_recepcion(Ok(ResultadoRecepcion {
        estado: EstadoRecepcion::Devuelta,
        clave_acceso: None,
        mensajes: vec![mensaje("43", "CLAVE ACCESO REGISTRADA")],
    }));
    let _ = orq
        .emitir_factura(TENANT, &borrador_sin_propina(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap_err();
    let devuelta = clave_enviada(&sri, 0);

    let err = orq
        .emitir_nota_credito(
            TENANT,
            &nota_credito(&devuelta, detalles()),
            &credencial(),
            SenalCancelacion::nunca(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::Validacion(_)));
}

#[tokio::test]
async fn test_certificado_expirado_no_registra_nada() {
    let (orq, sri, db) = orquestador(ConfigSri::sin_esperas(1));
    let expirado = CredencialFirma::nueva(P12_EXPIRADO.to_vec(), "clave-prueba");

    let err = orq
        .emitir_factura(TENANT, &borrador(), &expirado, SenalCancelacion::nunca())
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::Certificado(_)));
    assert!(sri.enviados().is_empty());

    let total: i64 = db
        .conn()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM comprobantes", [], |row| row.get(0))
        .unwrap();
    assert_eq!(total, 0);

    // El secuencial no se consumio
    let resultado = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap();
    assert_eq!(resultado.numero, "001-001-000000001");
}

#[tokio::test]
async fn test_password_incorrecta_no_aparece_en_el_error() {
    let (orq, _sri, _db) = orquestador(ConfigSri::sin_esperas(1));
    let credencial = CredencialFirma::nueva(P12_PRUEBA.to_vec(), "password-equivocada-987");

    let err = orq.validar_certificado(&credencial).unwrap_err();
    assert!(matches!(err, ErrorSri::Certificado(_)));
    assert!(!err.to_string().contains("password-equivocada-987"));

    let info = orq.validar_certificado(&self::credencial()).unwrap();
    assert_eq!(info.serial, "123456789");
}

#[tokio::test]
async fn test_sin_configuracion_del_tenant() {
    let (orq, _sri, _db) = orquestador(ConfigSri::sin_esperas(1));
    let err = orq
        .emitir_factura("otro-tenant", &borrador(), &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::Configuracion(_)));
}

#[tokio::test]
async fn test_borrador_incoherente_falla_antes_de_firmar() {
    let (orq, sri, _db) = orquestador(ConfigSri::sin_esperas(1));
    let mut malo = borrador();
    malo.totales.importe_total = 20.00;

    let err = orq
        .emitir_factura(TENANT, &malo, &credencial(), SenalCancelacion::nunca())
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::Validacion(_)));
    assert!(sri.enviados().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelacion_durante_el_sondeo() {
    let mut config = ConfigSri::sin_esperas(1);
    config.esperas_autorizacion = vec![Duration::ZERO, Duration::from_secs(30)];
    let (orq, sri, _db) = orquestador(config);
    sri.encolar_autorizacion(Ok(ResultadoAutorizacion::en_proceso()));

    let (cancelador, senal) = canal();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancelador.cancelar();
    });

    let err = orq
        .emitir_factura(TENANT, &borrador(), &credencial(), senal)
        .await
        .unwrap_err();
    assert!(matches!(err, ErrorSri::Cancelado(_)));
    assert_eq!(sri.consultas(), 1);

    let clave = clave_enviada(&sri, 0);
    assert_eq!(orq.consultar(TENANT, &clave).unwrap().estado, EstadoComprobante::Recibido);

    let resultado = orq
        .reanudar(TENANT, &clave, SenalCancelacion::nunca())
        .await
        .unwrap();
    assert!(resultado.autorizado());
}

#[tokio::test]
async fn test_consultas_de_clave_desconocida() {
    let (orq, _sri, _db) = orquestador(ConfigSri::sin_esperas(1));
    let clave = generar_clave_acceso(
        fecha(),
        TipoComprobante::Factura,
        "0912345678001",
        Ambiente::Pruebas,
        "001",
        "001",
        999,
        12345678,
        EMISION_NORMAL,
    )
    .unwrap();

    assert!(matches!(orq.consultar(TENANT, &clave), Err(ErrorSri::Validacion(_))));
    assert!(matches!(orq.obtener_xml_firmado(TENANT, &clave), Err(ErrorSri::Validacion(_))));
    assert!(matches!(orq.historial(TENANT, &clave), Err(ErrorSri::Validacion(_))));
    assert!(orq
        .reanudar(TENANT, &clave, SenalCancelacion::nunca())
        .await
        .is_err());
}
