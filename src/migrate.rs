use anyhow::Result;
use sqlx::SqlitePool;

/// Create the schema. Every statement is idempotent so this runs on
/// every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_url TEXT UNIQUE,
            reference TEXT,
            publication_date TEXT,
            file_path TEXT,
            file_size_bytes INTEGER,
            text_path TEXT,
            text_path_translated TEXT,
            title TEXT,
            title_translated TEXT,
            subject TEXT,
            subject_translated TEXT,
            summary TEXT,
            summary_translated TEXT,
            keywords TEXT,
            keywords_translated TEXT,
            entities TEXT,
            entities_translated TEXT,
            embedding BLOB,
            embedding_translated BLOB,
            collect_status TEXT DEFAULT 'pending',
            download_status TEXT DEFAULT 'pending',
            extract_status TEXT DEFAULT 'pending',
            analyze_status TEXT DEFAULT 'pending',
            embed_status TEXT DEFAULT 'pending',
            error_log TEXT,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
            downloaded_at TEXT,
            extracted_at TEXT,
            analyzed_at TEXT,
            embedded_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chambers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            name_translated TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS themes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chamber_id INTEGER,
            name TEXT NOT NULL,
            name_translated TEXT,
            FOREIGN KEY (chamber_id) REFERENCES chambers(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_classifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            chamber_id INTEGER,
            theme_id INTEGER,
            UNIQUE(document_id, chamber_id, theme_id),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS keyword_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token TEXT NOT NULL,
            document_id INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_keyword_index_token ON keyword_index(token)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_keyword_index_document ON keyword_index(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_reference ON documents(reference)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_publication_date ON documents(publication_date)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_classifications_document ON document_classifications(document_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
