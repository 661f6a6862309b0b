use rusqlite::Connection;

pub fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- Configuración del negocio (por tenant)
        CREATE TABLE IF NOT EXISTS config (
            tenant TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (tenant, key)
        );

        -- Contadores de secuencial por establecimiento, punto de emision y tipo
        CREATE TABLE IF NOT EXISTS secuenciales (
            tenant TEXT NOT NULL,
            establecimiento TEXT NOT NULL,
            punto_emision TEXT NOT NULL,
            cod_doc TEXT NOT NULL,
            ultimo INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (tenant, establecimiento, punto_emision, cod_doc)
        );

        -- Secuenciales asignados que no llegaron a un comprobante registrado
        CREATE TABLE IF NOT EXISTS secuenciales_huecos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant TEXT NOT NULL,
            establecimiento TEXT NOT NULL,
            punto_emision TEXT NOT NULL,
            cod_doc TEXT NOT NULL,
            secuencial INTEGER NOT NULL,
            motivo TEXT NOT NULL,
            fecha TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
        );

        -- Comprobantes electronicos
        CREATE TABLE IF NOT EXISTS comprobantes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tenant TEXT NOT NULL,
            cod_doc TEXT NOT NULL,
            clave_acceso TEXT UNIQUE NOT NULL,
            numero TEXT NOT NULL,
            fecha_emision TEXT NOT NULL,
            estado TEXT NOT NULL DEFAULT 'BORRADOR',
            importe_total REAL NOT NULL DEFAULT 0,
            xml TEXT,
            xml_firmado TEXT,
            numero_autorizacion TEXT,
            fecha_autorizacion TEXT,
            documento_modificado TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
        );

        CREATE INDEX IF NOT EXISTS idx_comprobantes_tenant ON comprobantes(tenant, estado);
        CREATE INDEX IF NOT EXISTS idx_comprobantes_modificado ON comprobantes(documento_modificado);

        -- Historial de estados (solo insercion)
        CREATE TABLE IF NOT EXISTS comprobante_transiciones (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            comprobante_id INTEGER NOT NULL,
            desde TEXT,
            hacia TEXT NOT NULL,
            fecha TEXT NOT NULL,
            detalle TEXT,
            FOREIGN KEY (comprobante_id) REFERENCES comprobantes(id)
        );

        CREATE INDEX IF NOT EXISTS idx_transiciones_comprobante ON comprobante_transiciones(comprobante_id);

        CREATE TRIGGER IF NOT EXISTS transiciones_sin_update
        BEFORE UPDATE ON comprobante_transiciones
        BEGIN
            SELECT RAISE(ABORT, 'comprobante_transiciones es de solo insercion');
        END;

        CREATE TRIGGER IF NOT EXISTS transiciones_sin_delete
        BEFORE DELETE ON comprobante_transiciones
        BEGIN
            SELECT RAISE(ABORT, 'comprobante_transiciones es de solo insercion');
        END;

        -- Mensajes devueltos por el SRI
        CREATE TABLE IF NOT EXISTS comprobante_mensajes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            comprobante_id INTEGER NOT NULL,
            etapa TEXT NOT NULL,
            identificador TEXT NOT NULL,
            mensaje TEXT NOT NULL,
            informacion_adicional TEXT,
            tipo TEXT NOT NULL,
            fecha TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
            FOREIGN KEY (comprobante_id) REFERENCES comprobantes(id)
        );

        CREATE INDEX IF NOT EXISTS idx_mensajes_comprobante ON comprobante_mensajes(comprobante_id);
        ",
    )?;

    Ok(())
}
