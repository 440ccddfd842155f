//! Postgres `SyncStore`: one transaction per bundle, conditional upserts.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bsync_core::{Client, DefaulterDetail, Document, NormalizedBundle, ProductClient, Proposal};
use bsync_storage::{retry_with_backoff, BackoffPolicy};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::{BundleContext, BundleWriteStats, PersistenceError, SyncStore, UpsertOutcome};

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const CLIENT_COLUMNS: &[&str] = &[
    "tenant_id",
    "documento",
    "broker_id",
    "nome",
    "tipo_documento",
    "data_nascimento",
    "telefone",
    "email",
    "endereco",
    "numero",
    "complemento",
    "bairro",
    "cidade",
    "uf",
    "cep",
    "titular_cpf",
    "sexo",
    "estado_civil",
    "numero_documento",
    "orgao_expedidor",
    "renda_patrimonio",
    "profissao",
];
const CLIENT_KEY: &[&str] = &["tenant_id", "documento"];

const PROPOSAL_COLUMNS: &[&str] = &[
    "tenant_id",
    "proposta",
    "insurance_company_id",
    "broker_id",
    "client_id",
    "produto",
    "linha_negocio",
    "criada_em",
    "status_proposta",
    "forma_pagamento",
    "valor",
    "vencimento",
    "competencia",
    "status_pagamento",
    "motivo_pendencia",
    "\"data\"",
];
const PROPOSAL_KEY: &[&str] = &["tenant_id", "proposta"];

const DEFAULTER_COLUMNS: &[&str] = &[
    "tenant_id",
    "client_id",
    "proposal_number",
    "certificate_number",
    "competency",
    "broker_name",
    "client_name",
    "client_cpf",
    "business_line",
    "product_name",
    "original_due_date",
    "current_due_date",
    "contribution_value",
    "payment_status",
    "payment_method",
    "delay_days",
];
const DEFAULTER_KEY: &[&str] = &["tenant_id", "client_id", "proposal_number", "certificate_number", "competency"];

const PRODUCT_COLUMNS: &[&str] = &[
    "tenant_id",
    "client_id",
    "proposal_number",
    "certificate_number",
    "coverage_name",
    "broker_name",
    "business_line",
    "product_type",
    "product_status",
    "insured_capital",
    "coverage_payment_period",
    "due_day",
    "last_payment",
    "next_payment",
    "paid_installments_quantity",
    "pending_installments_quantity",
    "payment_frequency",
];
const PRODUCT_KEY: &[&str] = &["tenant_id", "client_id", "proposal_number", "certificate_number", "coverage_name"];

/// `INSERT .. ON CONFLICT .. DO UPDATE` that only touches the row (and
/// `updated_at`) when a non-key column actually changes. Returns no row when
/// nothing changed, otherwise `inserted` tells insert from update.
fn upsert_sql(table: &str, columns: &[&str], key: &[&str]) -> String {
    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mutable: Vec<&str> = columns.iter().copied().filter(|c| !key.contains(c)).collect();
    let assignments = mutable
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let current = mutable
        .iter()
        .map(|c| format!("{table}.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let incoming = mutable
        .iter()
        .map(|c| format!("EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({columns}) VALUES ({placeholders}) \
         ON CONFLICT ({key}) DO UPDATE SET {assignments}, updated_at = NOW() \
         WHERE ({current}) IS DISTINCT FROM ({incoming}) \
         RETURNING (xmax = 0) AS inserted",
        columns = columns.join(", "),
        key = key.join(", "),
    )
}

#[derive(Debug, Clone)]
struct Statements {
    client: String,
    proposal: String,
    defaulter: String,
    product: String,
}

impl Statements {
    fn new() -> Self {
        Self {
            client: upsert_sql("clients", CLIENT_COLUMNS, CLIENT_KEY),
            proposal: upsert_sql("proposals", PROPOSAL_COLUMNS, PROPOSAL_KEY),
            defaulter: upsert_sql("defaulters_detailed", DEFAULTER_COLUMNS, DEFAULTER_KEY),
            product: upsert_sql("products_clients", PRODUCT_COLUMNS, PRODUCT_KEY),
        }
    }
}

/// Connection loss, serialization failures and server shutdown are worth
/// retrying; everything else is a property of the data.
pub fn classify_sqlx_error(err: &sqlx::Error) -> PersistenceError {
    let transient = match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| code.starts_with("08") || matches!(&*code, "40001" | "40P01" | "57P01")),
        _ => false,
    };
    if transient {
        PersistenceError::Transient(err.to_string())
    } else {
        PersistenceError::Data(err.to_string())
    }
}

fn db_err(err: sqlx::Error) -> PersistenceError {
    classify_sqlx_error(&err)
}

/// Escape LIKE wildcards in a broker name and turn it into a prefix pattern.
fn like_prefix(name: &str) -> String {
    let mut pattern = String::with_capacity(name.len() + 1);
    for ch in name.trim().chars() {
        if matches!(ch, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

pub struct PgSyncStore {
    pool: PgPool,
    statements: Statements,
}

impl PgSyncStore {
    pub async fn connect(database_url: &str, max_connections: u32, backoff: &BackoffPolicy) -> anyhow::Result<Self> {
        let options = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10));
        let pool = retry_with_backoff(
            backoff,
            |err: &PersistenceError| err.disposition(),
            || async { options.clone().connect(database_url).await.map_err(db_err) },
        )
        .await
        .context("connecting to the database")?;
        info!(max_connections, "database pool ready");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            statements: Statements::new(),
        }
    }

    async fn upsert_client(
        &self,
        conn: &mut PgConnection,
        ctx: &BundleContext,
        client: &Client,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let row = sqlx::query(&self.statements.client)
            .bind(ctx.tenant_id)
            .bind(client.document.digits())
            .bind(ctx.broker_id)
            .bind(&client.name)
            .bind(client.document.kind().as_str())
            .bind(client.birth_date)
            .bind(&client.phone)
            .bind(&client.email)
            .bind(&client.address)
            .bind(&client.address_number)
            .bind(&client.address_complement)
            .bind(&client.district)
            .bind(&client.city)
            .bind(&client.state)
            .bind(&client.postal_code)
            .bind(&client.holder_document)
            .bind(&client.sex)
            .bind(&client.marital_status)
            .bind(&client.id_number)
            .bind(&client.id_issuer)
            .bind(&client.income)
            .bind(&client.profession)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
        outcome_of(row)
    }

    async fn client_id(
        &self,
        conn: &mut PgConnection,
        ctx: &BundleContext,
        document: &Document,
    ) -> Result<Option<i64>, PersistenceError> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM clients WHERE tenant_id = $1 AND documento = $2")
            .bind(ctx.tenant_id)
            .bind(document.digits())
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)
    }

    /// Create a placeholder client when none exists yet; never overwrites.
    async fn ensure_client(
        &self,
        conn: &mut PgConnection,
        ctx: &BundleContext,
        document: &Document,
        name: Option<&str>,
    ) -> Result<(i64, UpsertOutcome), PersistenceError> {
        if let Some(id) = self.client_id(conn, ctx, document).await? {
            return Ok((id, UpsertOutcome::Unchanged));
        }
        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO clients (tenant_id, documento, broker_id, nome, tipo_documento)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, documento) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(ctx.tenant_id)
        .bind(document.digits())
        .bind(ctx.broker_id)
        .bind(name.unwrap_or(Client::UNKNOWN_NAME))
        .bind(document.kind().as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?;
        match inserted {
            Some(id) => Ok((id, UpsertOutcome::Inserted)),
            None => {
                let id = self
                    .client_id(conn, ctx, document)
                    .await?
                    .ok_or_else(|| PersistenceError::Data(format!("client {document} vanished during upsert")))?;
                Ok((id, UpsertOutcome::Unchanged))
            }
        }
    }

    async fn upsert_proposal(
        &self,
        conn: &mut PgConnection,
        ctx: &BundleContext,
        client_id: i64,
        proposal: &Proposal,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let row = sqlx::query(&self.statements.proposal)
            .bind(ctx.tenant_id)
            .bind(&proposal.proposal_number)
            .bind(ctx.insurance_company_id)
            .bind(ctx.broker_id)
            .bind(client_id)
            .bind(&proposal.product)
            .bind(&proposal.business_line)
            .bind(proposal.created_on)
            .bind(&proposal.proposal_status)
            .bind(&proposal.payment_method)
            .bind(proposal.amount)
            .bind(proposal.due_date)
            .bind(&proposal.competency)
            .bind(&proposal.payment_status)
            .bind(&proposal.pending_reason)
            .bind(proposal.status_date)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
        outcome_of(row)
    }

    async fn upsert_defaulter(
        &self,
        conn: &mut PgConnection,
        ctx: &BundleContext,
        client_id: i64,
        detail: &DefaulterDetail,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let row = sqlx::query(&self.statements.defaulter)
            .bind(ctx.tenant_id)
            .bind(client_id)
            .bind(&detail.proposal_number)
            .bind(&detail.certificate_number)
            .bind(&detail.competency)
            .bind(&ctx.broker_name)
            .bind(&detail.client_name)
            .bind(detail.document.digits())
            .bind(&detail.business_line)
            .bind(&detail.product_name)
            .bind(detail.original_due_date)
            .bind(detail.current_due_date)
            .bind(detail.contribution_value)
            .bind(&detail.payment_status)
            .bind(&detail.payment_method)
            .bind(detail.delay_days)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
        outcome_of(row)
    }

    async fn upsert_product(
        &self,
        conn: &mut PgConnection,
        ctx: &BundleContext,
        client_id: i64,
        product: &ProductClient,
    ) -> Result<UpsertOutcome, PersistenceError> {
        let row = sqlx::query(&self.statements.product)
            .bind(ctx.tenant_id)
            .bind(client_id)
            .bind(&product.proposal_number)
            .bind(&product.certificate_number)
            .bind(&product.coverage_name)
            .bind(&ctx.broker_name)
            .bind(&product.business_line)
            .bind(&product.product_type)
            .bind(&product.product_status)
            .bind(product.insured_capital)
            .bind(&product.coverage_payment_period)
            .bind(&product.due_day)
            .bind(product.last_payment)
            .bind(product.next_payment)
            .bind(&product.paid_installments)
            .bind(&product.pending_installments)
            .bind(&product.payment_frequency)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_err)?;
        outcome_of(row)
    }
}

fn outcome_of(row: Option<sqlx::postgres::PgRow>) -> Result<UpsertOutcome, PersistenceError> {
    match row {
        None => Ok(UpsertOutcome::Unchanged),
        Some(row) => {
            let inserted: bool = row.try_get("inserted").map_err(db_err)?;
            Ok(if inserted {
                UpsertOutcome::Inserted
            } else {
                UpsertOutcome::Updated
            })
        }
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn resolve_broker(&self, unit_name: &str) -> Result<Option<i64>, PersistenceError> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id
              FROM brokers
             WHERE UPPER(nome_completo) LIKE UPPER($1) ESCAPE '\'
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(like_prefix(unit_name))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn apply_bundle(
        &self,
        ctx: &BundleContext,
        bundle: &NormalizedBundle,
    ) -> Result<BundleWriteStats, PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut stats = BundleWriteStats::default();

        for client in &bundle.clients {
            stats.clients.record(self.upsert_client(&mut tx, ctx, client).await?);
        }

        for proposal in &bundle.proposals {
            let (client_id, created) = self
                .ensure_client(&mut tx, ctx, &proposal.document, proposal.client_name.as_deref())
                .await?;
            if created == UpsertOutcome::Inserted {
                stats.clients.record(created);
            }
            stats
                .proposals
                .record(self.upsert_proposal(&mut tx, ctx, client_id, proposal).await?);
        }

        for detail in &bundle.defaulters {
            let outcome = match self.client_id(&mut tx, ctx, &detail.document).await? {
                Some(client_id) => self.upsert_defaulter(&mut tx, ctx, client_id, detail).await?,
                None => UpsertOutcome::Skipped,
            };
            stats.defaulters.record(outcome);
        }

        for product in &bundle.products {
            let outcome = match self.client_id(&mut tx, ctx, &product.document).await? {
                Some(client_id) => self.upsert_product(&mut tx, ctx, client_id, product).await?,
                None => UpsertOutcome::Skipped,
            };
            stats.products.record(outcome);
        }

        // Dropping `tx` on any early return above rolls the bundle back.
        tx.commit().await.map_err(db_err)?;
        debug!(broker_id = ctx.broker_id, rows_written = stats.written(), "bundle committed");
        Ok(stats)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Apply `migrations/` to the database at `database_url`.
pub async fn migrate(database_url: &str) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
        .context("connecting to the database")?;
    MIGRATOR.run(&pool).await.context("applying migrations")?;
    info!(migrations = MIGRATOR.iter().count(), "migrations applied");
    pool.close().await;
    Ok(())
}
