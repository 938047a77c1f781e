//! Postgres ledger store for quote-to-cash-service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::HistogramTimer;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use super::error::StoreError;
use super::metrics::DB_QUERY_DURATION;
use super::store::{
    ChangeOrderSignatureWrite, CommissionUpdate, LedgerStore, QuoteSignatureWrite, ShareLink,
    StoreResult,
};
use crate::models::{
    ChangeOrder, ChangeOrderLineItem, Commission, CommissionAssignment, CommissionRole, Contract,
    ContractLineItem, DocumentKind, Invoice, InvoiceLineItem, InvoiceSettlement, LineItemInput,
    NewChangeOrder, NewContract, NewInvoice, NewInvoiceLineItem, NewPayment, NewQuote,
    NewSignature, Payment, Quote, QuoteLineItem, QuoteTotals, SequenceKind, Signature,
};

const QUOTE_COLUMNS: &str = "quote_id, company_id, lead_id, created_by, title, customer_name, \
    customer_email, status, signing_state, subtotal, discount, tax_rate, tax, total, is_locked, \
    share_token, share_link_expires_at, deleted_utc, created_utc, updated_utc";

const QUOTE_LINE_ITEM_COLUMNS: &str =
    "line_item_id, quote_id, description, quantity, unit_price, total, sort_order";

const SIGNATURE_COLUMNS: &str = "signature_id, company_id, document_kind, document_id, role, \
    signer_name, signer_title, signature_image, ip_address, user_agent, signed_by_user_id, \
    signed_utc";

const CONTRACT_COLUMNS: &str = "contract_id, company_id, quote_id, lead_id, revision, status, \
    change_order_id, original_subtotal, original_discount, original_tax, original_total, \
    current_subtotal, current_discount, current_tax, current_total, customer_signer_name, \
    customer_signature_image, customer_signed_utc, company_signer_name, company_signature_image, \
    company_signed_utc, void_reason, voided_by, voided_utc, created_utc";

const CONTRACT_LINE_ITEM_COLUMNS: &str = "contract_line_item_id, contract_id, description, \
    quantity, unit_price, total, sort_order, change_order_id";

const CHANGE_ORDER_COLUMNS: &str = "change_order_id, company_id, lead_id, quote_id, \
    change_order_number, title, description, amount, tax_rate, tax, total, status, share_token, \
    share_link_expires_at, created_by, approved_utc, rejected_utc, rejection_reason, created_utc, \
    updated_utc";

const CHANGE_ORDER_LINE_ITEM_COLUMNS: &str =
    "line_item_id, change_order_id, description, quantity, unit_price, total, sort_order";

const INVOICE_COLUMNS: &str = "invoice_id, company_id, lead_id, quote_id, contract_id, \
    invoice_number, invoice_date, due_date, tax_rate, status, subtotal, tax_total, total, \
    amount_paid, amount_cleared, balance_due, share_token, share_link_expires_at, created_by, \
    sent_utc, cancelled_utc, created_utc, updated_utc";

const INVOICE_LINE_ITEM_COLUMNS: &str = "line_item_id, invoice_id, description, quantity, \
    unit_price, subtotal, tax_amount, total, source_type, source_id, sort_order";

const PAYMENT_COLUMNS: &str = "payment_id, company_id, invoice_id, lead_id, amount, method, \
    payment_date, reference, notes, cleared, cleared_utc, recorded_by, deleted_utc, created_utc";

const COMMISSION_COLUMNS: &str = "commission_id, company_id, lead_id, quote_id, role, \
    assignee_user_id, paid_when, rate, flat_amount, amount, status, eligible_utc, cancelled_utc, \
    created_utc, updated_utc";

fn query_timer(operation: &str) -> HistogramTimer {
    DB_QUERY_DURATION
        .with_label_values(&[operation])
        .start_timer()
}

fn conflict(what: &str, id: Uuid) -> StoreError {
    StoreError::Conflict(format!("{} {} not in expected state", what, id))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "quote-to-cash-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn insert_quote_items(
        tx: &mut Transaction<'_, Postgres>,
        quote_id: Uuid,
        items: &[LineItemInput],
    ) -> StoreResult<()> {
        for (index, item) in items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO quote_line_items (line_item_id, quote_id, description, quantity, unit_price, total, sort_order)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(quote_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.total()?)
            .bind(index as i32)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn insert_signature(
        tx: &mut Transaction<'_, Postgres>,
        signature: &NewSignature,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO signatures (signature_id, company_id, document_kind, document_id, role,
                signer_name, signer_title, signature_image, ip_address, user_agent,
                signed_by_user_id, signed_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(signature.company_id)
        .bind(signature.document_kind.as_str())
        .bind(signature.document_id)
        .bind(signature.role.as_str())
        .bind(&signature.signer_name)
        .bind(&signature.signer_title)
        .bind(&signature.signature_image)
        .bind(&signature.ip_address)
        .bind(&signature.user_agent)
        .bind(signature.signed_by_user_id)
        .bind(signature.signed_utc)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn fetch_invoice(&self, invoice_id: Uuid) -> StoreResult<Invoice> {
        sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("invoice", invoice_id))
    }
}

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(company_id = %company_id, kind = kind.as_str()))]
    async fn next_sequence(&self, company_id: Uuid, kind: SequenceKind) -> StoreResult<i64> {
        let timer = query_timer("next_sequence");
        let value = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO document_sequences (company_id, sequence_kind, last_value)
            VALUES ($1, $2, 1)
            ON CONFLICT (company_id, sequence_kind)
            DO UPDATE SET last_value = document_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(company_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        timer.observe_duration();
        Ok(value)
    }

    #[instrument(skip(self, input, totals), fields(company_id = %input.company_id, lead_id = %input.lead_id))]
    async fn insert_quote(&self, input: &NewQuote, totals: QuoteTotals) -> StoreResult<Quote> {
        let timer = query_timer("insert_quote");
        let mut tx = self.pool.begin().await?;

        let quote = sqlx::query_as::<_, Quote>(&format!(
            r#"
            INSERT INTO quotes (quote_id, company_id, lead_id, created_by, title, customer_name,
                customer_email, subtotal, discount, tax_rate, tax, total)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            QUOTE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(input.lead_id)
        .bind(input.created_by)
        .bind(&input.title)
        .bind(&input.customer_name)
        .bind(&input.customer_email)
        .bind(totals.subtotal)
        .bind(totals.discount)
        .bind(input.tax_rate)
        .bind(totals.tax)
        .bind(totals.total)
        .fetch_one(&mut *tx)
        .await?;

        Self::insert_quote_items(&mut tx, quote.quote_id, &input.line_items).await?;
        tx.commit().await?;
        timer.observe_duration();

        info!(quote_id = %quote.quote_id, total = %quote.total, "Quote created");
        Ok(quote)
    }

    #[instrument(skip(self))]
    async fn get_quote(&self, company_id: Uuid, quote_id: Uuid) -> StoreResult<Option<Quote>> {
        let timer = query_timer("get_quote");
        let quote = sqlx::query_as::<_, Quote>(&format!(
            "SELECT {} FROM quotes WHERE company_id = $1 AND quote_id = $2 AND deleted_utc IS NULL",
            QUOTE_COLUMNS
        ))
        .bind(company_id)
        .bind(quote_id)
        .fetch_optional(&self.pool)
        .await?;
        timer.observe_duration();
        Ok(quote)
    }

    #[instrument(skip(self, share_token))]
    async fn get_quote_by_token(&self, share_token: &str) -> StoreResult<Option<Quote>> {
        let timer = query_timer("get_quote_by_token");
        let quote = sqlx::query_as::<_, Quote>(&format!(
            "SELECT {} FROM quotes WHERE share_token = $1 AND deleted_utc IS NULL",
            QUOTE_COLUMNS
        ))
        .bind(share_token)
        .fetch_optional(&self.pool)
        .await?;
        timer.observe_duration();
        Ok(quote)
    }

    #[instrument(skip(self))]
    async fn list_quotes_for_lead(&self, company_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Quote>> {
        let quotes = sqlx::query_as::<_, Quote>(&format!(
            r#"
            SELECT {} FROM quotes
            WHERE company_id = $1 AND lead_id = $2 AND deleted_utc IS NULL
            ORDER BY created_utc
            "#,
            QUOTE_COLUMNS
        ))
        .bind(company_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(quotes)
    }

    #[instrument(skip(self))]
    async fn list_quote_line_items(&self, quote_id: Uuid) -> StoreResult<Vec<QuoteLineItem>> {
        let items = sqlx::query_as::<_, QuoteLineItem>(&format!(
            "SELECT {} FROM quote_line_items WHERE quote_id = $1 ORDER BY sort_order",
            QUOTE_LINE_ITEM_COLUMNS
        ))
        .bind(quote_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    #[instrument(skip(self, items, totals))]
    async fn replace_quote_line_items(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
        items: &[LineItemInput],
        totals: QuoteTotals,
    ) -> StoreResult<Quote> {
        let timer = query_timer("replace_quote_line_items");
        let mut tx = self.pool.begin().await?;

        let quote = sqlx::query_as::<_, Quote>(&format!(
            r#"
            UPDATE quotes
            SET subtotal = $3, discount = $4, tax = $5, total = $6, updated_utc = NOW()
            WHERE company_id = $1 AND quote_id = $2 AND deleted_utc IS NULL AND is_locked = FALSE
            RETURNING {}
            "#,
            QUOTE_COLUMNS
        ))
        .bind(company_id)
        .bind(quote_id)
        .bind(totals.subtotal)
        .bind(totals.discount)
        .bind(totals.tax)
        .bind(totals.total)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| conflict("quote", quote_id))?;

        sqlx::query("DELETE FROM quote_line_items WHERE quote_id = $1")
            .bind(quote_id)
            .execute(&mut *tx)
            .await?;
        Self::insert_quote_items(&mut tx, quote_id, items).await?;
        tx.commit().await?;
        timer.observe_duration();
        Ok(quote)
    }

    #[instrument(skip(self))]
    async fn refresh_quote_totals(&self, company_id: Uuid, quote_id: Uuid) -> StoreResult<Quote> {
        let timer = query_timer("refresh_quote_totals");
        let mut tx = self.pool.begin().await?;
        let quote = sqlx::query_as::<_, Quote>(&format!(
            r#"
            SELECT {} FROM quotes
            WHERE company_id = $1 AND quote_id = $2 AND deleted_utc IS NULL
            FOR UPDATE
            "#,
            QUOTE_COLUMNS
        ))
        .bind(company_id)
        .bind(quote_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| conflict("quote", quote_id))?;

        let items: Vec<LineItemInput> = sqlx::query_as::<_, QuoteLineItem>(&format!(
            "SELECT {} FROM quote_line_items WHERE quote_id = $1 ORDER BY sort_order",
            QUOTE_LINE_ITEM_COLUMNS
        ))
        .bind(quote_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|i| LineItemInput {
            description: i.description,
            quantity: i.quantity,
            unit_price: i.unit_price,
        })
        .collect();
        let change_orders = sqlx::query_as::<_, ChangeOrder>(&format!(
            r#"
            SELECT {} FROM change_orders
            WHERE company_id = $1 AND quote_id = $2 AND status = 'approved'
            "#,
            CHANGE_ORDER_COLUMNS
        ))
        .bind(company_id)
        .bind(quote_id)
        .fetch_all(&mut *tx)
        .await?;

        let totals = QuoteTotals::live(&items, quote.discount, quote.tax_rate, &change_orders)?;
        let quote = sqlx::query_as::<_, Quote>(&format!(
            r#"
            UPDATE quotes
            SET subtotal = $3, discount = $4, tax = $5, total = $6, updated_utc = NOW()
            WHERE company_id = $1 AND quote_id = $2
            RETURNING {}
            "#,
            QUOTE_COLUMNS
        ))
        .bind(company_id)
        .bind(quote_id)
        .bind(totals.subtotal)
        .bind(totals.discount)
        .bind(totals.tax)
        .bind(totals.total)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        timer.observe_duration();
        Ok(quote)
    }

    #[instrument(skip(self))]
    async fn soft_delete_quote(&self, company_id: Uuid, quote_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE quotes SET deleted_utc = NOW(), updated_utc = NOW()
            WHERE company_id = $1 AND quote_id = $2 AND deleted_utc IS NULL AND is_locked = FALSE
            "#,
        )
        .bind(company_id)
        .bind(quote_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(conflict("quote", quote_id));
        }
        Ok(())
    }

    #[instrument(skip(self, link))]
    async fn mark_quote_sent(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
        link: &ShareLink,
    ) -> StoreResult<Quote> {
        let quote = sqlx::query_as::<_, Quote>(&format!(
            r#"
            UPDATE quotes
            SET share_token = $3, share_link_expires_at = $4,
                status = CASE WHEN status = 'draft' THEN 'sent' ELSE status END,
                updated_utc = NOW()
            WHERE company_id = $1 AND quote_id = $2 AND deleted_utc IS NULL
            RETURNING {}
            "#,
            QUOTE_COLUMNS
        ))
        .bind(company_id)
        .bind(quote_id)
        .bind(&link.token)
        .bind(link.expires_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("quote", quote_id))?;
        Ok(quote)
    }

    #[instrument(skip(self, write), fields(quote_id = %write.signature.document_id, role = write.signature.role.as_str()))]
    async fn record_quote_signature(&self, write: &QuoteSignatureWrite) -> StoreResult<Quote> {
        let timer = query_timer("record_quote_signature");
        let signature = &write.signature;
        let mut tx = self.pool.begin().await?;

        let quote = sqlx::query_as::<_, Quote>(&format!(
            r#"
            UPDATE quotes
            SET signing_state = $3, is_locked = $4,
                status = CASE WHEN $5 THEN 'accepted' ELSE status END,
                updated_utc = NOW()
            WHERE company_id = $1 AND quote_id = $2 AND signing_state = $6 AND deleted_utc IS NULL
            RETURNING {}
            "#,
            QUOTE_COLUMNS
        ))
        .bind(signature.company_id)
        .bind(signature.document_id)
        .bind(write.next.as_str())
        .bind(write.next == crate::models::SigningState::FullySigned)
        .bind(write.accept)
        .bind(write.expected.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| conflict("quote", signature.document_id))?;

        Self::insert_signature(&mut tx, signature).await?;
        tx.commit().await?;
        timer.observe_duration();
        Ok(quote)
    }

    #[instrument(skip(self))]
    async fn list_signatures(
        &self,
        document_kind: DocumentKind,
        document_id: Uuid,
    ) -> StoreResult<Vec<Signature>> {
        let signatures = sqlx::query_as::<_, Signature>(&format!(
            r#"
            SELECT {} FROM signatures
            WHERE document_kind = $1 AND document_id = $2
            ORDER BY signed_utc
            "#,
            SIGNATURE_COLUMNS
        ))
        .bind(document_kind.as_str())
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(signatures)
    }

    #[instrument(skip(self, input), fields(quote_id = %input.quote_id))]
    async fn insert_contract(&self, input: &NewContract) -> StoreResult<Contract> {
        let timer = query_timer("insert_contract");
        let mut tx = self.pool.begin().await?;

        // Serializes revision numbering per quote.
        sqlx::query("SELECT quote_id FROM quotes WHERE quote_id = $1 FOR UPDATE")
            .bind(input.quote_id)
            .execute(&mut *tx)
            .await?;

        let revision = sqlx::query_scalar::<_, i32>(
            "SELECT COALESCE(MAX(revision), 0) + 1 FROM contracts WHERE quote_id = $1",
        )
        .bind(input.quote_id)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(superseded) = input.supersedes {
            let result = sqlx::query(
                r#"
                UPDATE contracts SET status = 'superseded'
                WHERE contract_id = $1 AND quote_id = $2 AND status = 'active'
                "#,
            )
            .bind(superseded)
            .bind(input.quote_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict(format!(
                    "contract {} is no longer active",
                    superseded
                )));
            }
        }

        let contract = sqlx::query_as::<_, Contract>(&format!(
            r#"
            INSERT INTO contracts (contract_id, company_id, quote_id, lead_id, revision, status,
                change_order_id, original_subtotal, original_discount, original_tax, original_total,
                current_subtotal, current_discount, current_tax, current_total,
                customer_signer_name, customer_signature_image, customer_signed_utc,
                company_signer_name, company_signature_image, company_signed_utc)
            VALUES ($1, $2, $3, $4, $5, 'active', $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20)
            RETURNING {}
            "#,
            CONTRACT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(input.quote_id)
        .bind(input.lead_id)
        .bind(revision)
        .bind(input.change_order_id)
        .bind(input.original.subtotal)
        .bind(input.original.discount)
        .bind(input.original.tax)
        .bind(input.original.total)
        .bind(input.current.subtotal)
        .bind(input.current.discount)
        .bind(input.current.tax)
        .bind(input.current.total)
        .bind(&input.customer.signer_name)
        .bind(&input.customer.signature_image)
        .bind(input.customer.signed_utc)
        .bind(&input.company.signer_name)
        .bind(&input.company.signature_image)
        .bind(input.company.signed_utc)
        .fetch_one(&mut *tx)
        .await?;

        for (index, item) in input.line_items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO contract_line_items (contract_line_item_id, contract_id, description,
                    quantity, unit_price, total, sort_order, change_order_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(contract.contract_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.total)
            .bind(index as i32)
            .bind(item.change_order_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        timer.observe_duration();
        Ok(contract)
    }

    #[instrument(skip(self))]
    async fn get_contract(&self, company_id: Uuid, contract_id: Uuid) -> StoreResult<Option<Contract>> {
        let contract = sqlx::query_as::<_, Contract>(&format!(
            "SELECT {} FROM contracts WHERE company_id = $1 AND contract_id = $2",
            CONTRACT_COLUMNS
        ))
        .bind(company_id)
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(contract)
    }

    #[instrument(skip(self))]
    async fn list_contracts_for_quote(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
    ) -> StoreResult<Vec<Contract>> {
        let contracts = sqlx::query_as::<_, Contract>(&format!(
            "SELECT {} FROM contracts WHERE company_id = $1 AND quote_id = $2 ORDER BY revision",
            CONTRACT_COLUMNS
        ))
        .bind(company_id)
        .bind(quote_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(contracts)
    }

    #[instrument(skip(self))]
    async fn list_contracts_for_lead(
        &self,
        company_id: Uuid,
        lead_id: Uuid,
    ) -> StoreResult<Vec<Contract>> {
        let contracts = sqlx::query_as::<_, Contract>(&format!(
            r#"
            SELECT {} FROM contracts
            WHERE company_id = $1 AND lead_id = $2
            ORDER BY created_utc, revision
            "#,
            CONTRACT_COLUMNS
        ))
        .bind(company_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(contracts)
    }

    #[instrument(skip(self))]
    async fn list_contract_line_items(&self, contract_id: Uuid) -> StoreResult<Vec<ContractLineItem>> {
        let items = sqlx::query_as::<_, ContractLineItem>(&format!(
            "SELECT {} FROM contract_line_items WHERE contract_id = $1 ORDER BY sort_order",
            CONTRACT_LINE_ITEM_COLUMNS
        ))
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    #[instrument(skip(self, reason))]
    async fn void_contract(
        &self,
        company_id: Uuid,
        contract_id: Uuid,
        reason: &str,
        voided_by: Uuid,
    ) -> StoreResult<Contract> {
        let contract = sqlx::query_as::<_, Contract>(&format!(
            r#"
            UPDATE contracts
            SET status = 'voided', void_reason = $3, voided_by = $4, voided_utc = NOW()
            WHERE company_id = $1 AND contract_id = $2 AND status = 'active'
            RETURNING {}
            "#,
            CONTRACT_COLUMNS
        ))
        .bind(company_id)
        .bind(contract_id)
        .bind(reason)
        .bind(voided_by)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("contract", contract_id))?;
        Ok(contract)
    }

    #[instrument(skip(self, input), fields(quote_id = %input.quote_id, number = input.change_order_number))]
    async fn insert_change_order(&self, input: &NewChangeOrder) -> StoreResult<ChangeOrder> {
        let timer = query_timer("insert_change_order");
        let mut tx = self.pool.begin().await?;

        let change_order = sqlx::query_as::<_, ChangeOrder>(&format!(
            r#"
            INSERT INTO change_orders (change_order_id, company_id, lead_id, quote_id,
                change_order_number, title, description, amount, tax_rate, tax, total, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            CHANGE_ORDER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(input.lead_id)
        .bind(input.quote_id)
        .bind(input.change_order_number)
        .bind(&input.title)
        .bind(&input.description)
        .bind(input.amount)
        .bind(input.tax_rate)
        .bind(input.tax)
        .bind(input.total)
        .bind(input.created_by)
        .fetch_one(&mut *tx)
        .await?;

        for (index, item) in input.line_items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO change_order_line_items (line_item_id, change_order_id, description,
                    quantity, unit_price, total, sort_order)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(change_order.change_order_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.total()?)
            .bind(index as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        timer.observe_duration();
        Ok(change_order)
    }

    #[instrument(skip(self))]
    async fn get_change_order(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
    ) -> StoreResult<Option<ChangeOrder>> {
        let change_order = sqlx::query_as::<_, ChangeOrder>(&format!(
            "SELECT {} FROM change_orders WHERE company_id = $1 AND change_order_id = $2",
            CHANGE_ORDER_COLUMNS
        ))
        .bind(company_id)
        .bind(change_order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(change_order)
    }

    #[instrument(skip(self, share_token))]
    async fn get_change_order_by_token(&self, share_token: &str) -> StoreResult<Option<ChangeOrder>> {
        let change_order = sqlx::query_as::<_, ChangeOrder>(&format!(
            "SELECT {} FROM change_orders WHERE share_token = $1",
            CHANGE_ORDER_COLUMNS
        ))
        .bind(share_token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(change_order)
    }

    #[instrument(skip(self))]
    async fn list_change_orders_for_quote(
        &self,
        company_id: Uuid,
        quote_id: Uuid,
    ) -> StoreResult<Vec<ChangeOrder>> {
        let orders = sqlx::query_as::<_, ChangeOrder>(&format!(
            r#"
            SELECT {} FROM change_orders
            WHERE company_id = $1 AND quote_id = $2
            ORDER BY change_order_number
            "#,
            CHANGE_ORDER_COLUMNS
        ))
        .bind(company_id)
        .bind(quote_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(orders)
    }

    #[instrument(skip(self))]
    async fn list_change_order_line_items(
        &self,
        change_order_id: Uuid,
    ) -> StoreResult<Vec<ChangeOrderLineItem>> {
        let items = sqlx::query_as::<_, ChangeOrderLineItem>(&format!(
            "SELECT {} FROM change_order_line_items WHERE change_order_id = $1 ORDER BY sort_order",
            CHANGE_ORDER_LINE_ITEM_COLUMNS
        ))
        .bind(change_order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    #[instrument(skip(self, link))]
    async fn mark_change_order_sent(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
        link: &ShareLink,
    ) -> StoreResult<ChangeOrder> {
        let change_order = sqlx::query_as::<_, ChangeOrder>(&format!(
            r#"
            UPDATE change_orders
            SET share_token = $3, share_link_expires_at = $4,
                status = CASE WHEN status = 'pending' THEN 'sent' ELSE status END,
                updated_utc = NOW()
            WHERE company_id = $1 AND change_order_id = $2
            RETURNING {}
            "#,
            CHANGE_ORDER_COLUMNS
        ))
        .bind(company_id)
        .bind(change_order_id)
        .bind(&link.token)
        .bind(link.expires_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("change order", change_order_id))?;
        Ok(change_order)
    }

    #[instrument(skip(self, write), fields(change_order_id = %write.signature.document_id, role = write.signature.role.as_str()))]
    async fn record_change_order_signature(
        &self,
        write: &ChangeOrderSignatureWrite,
    ) -> StoreResult<ChangeOrder> {
        let timer = query_timer("record_change_order_signature");
        let signature = &write.signature;
        let mut tx = self.pool.begin().await?;

        let change_order = sqlx::query_as::<_, ChangeOrder>(&format!(
            r#"
            UPDATE change_orders
            SET status = $3,
                approved_utc = CASE WHEN $3 = 'approved' THEN NOW() ELSE approved_utc END,
                updated_utc = NOW()
            WHERE company_id = $1 AND change_order_id = $2 AND status = $4
            RETURNING {}
            "#,
            CHANGE_ORDER_COLUMNS
        ))
        .bind(signature.company_id)
        .bind(signature.document_id)
        .bind(write.next.as_str())
        .bind(write.expected.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| conflict("change order", signature.document_id))?;

        Self::insert_signature(&mut tx, signature).await?;
        tx.commit().await?;
        timer.observe_duration();
        Ok(change_order)
    }

    #[instrument(skip(self, reason))]
    async fn reject_change_order(
        &self,
        company_id: Uuid,
        change_order_id: Uuid,
        reason: Option<&str>,
    ) -> StoreResult<ChangeOrder> {
        let change_order = sqlx::query_as::<_, ChangeOrder>(&format!(
            r#"
            UPDATE change_orders
            SET status = 'rejected', rejected_utc = NOW(), rejection_reason = $3, updated_utc = NOW()
            WHERE company_id = $1 AND change_order_id = $2
              AND status NOT IN ('approved', 'rejected')
            RETURNING {}
            "#,
            CHANGE_ORDER_COLUMNS
        ))
        .bind(company_id)
        .bind(change_order_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("change order", change_order_id))?;
        Ok(change_order)
    }

    #[instrument(skip(self, input), fields(invoice_number = %input.invoice_number))]
    async fn insert_invoice(&self, input: &NewInvoice) -> StoreResult<Invoice> {
        let timer = query_timer("insert_invoice");
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (invoice_id, company_id, lead_id, quote_id, contract_id,
                invoice_number, invoice_date, due_date, tax_rate, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(input.lead_id)
        .bind(input.quote_id)
        .bind(input.contract_id)
        .bind(&input.invoice_number)
        .bind(input.invoice_date)
        .bind(input.due_date)
        .bind(input.tax_rate)
        .bind(input.created_by)
        .fetch_one(&self.pool)
        .await?;
        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self, items), fields(count = items.len()))]
    async fn insert_invoice_line_items(
        &self,
        invoice_id: Uuid,
        items: &[NewInvoiceLineItem],
    ) -> StoreResult<()> {
        let timer = query_timer("insert_invoice_line_items");
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items (line_item_id, invoice_id, description, quantity,
                    unit_price, subtotal, tax_amount, total, source_type, source_id, sort_order)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(invoice_id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(item.subtotal)
            .bind(item.tax_amount)
            .bind(item.total)
            .bind(item.source_type.as_str())
            .bind(item.source_id)
            .bind(item.sort_order)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_invoice(&self, invoice_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM invoice_line_items WHERE invoice_id = $1")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM invoices WHERE invoice_id = $1")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn refresh_invoice_totals(&self, invoice_id: Uuid) -> StoreResult<Invoice> {
        let timer = query_timer("refresh_invoice_totals");
        sqlx::query(
            r#"
            UPDATE invoices i
            SET subtotal = t.subtotal, tax_total = t.tax_total, total = t.total,
                balance_due = t.total - i.amount_paid, updated_utc = NOW()
            FROM (
                SELECT COALESCE(SUM(subtotal), 0) AS subtotal,
                       COALESCE(SUM(tax_amount), 0) AS tax_total,
                       COALESCE(SUM(total), 0) AS total
                FROM invoice_line_items WHERE invoice_id = $1
            ) t
            WHERE i.invoice_id = $1
            "#,
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await?;
        let invoice = self.fetch_invoice(invoice_id).await?;
        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn get_invoice(&self, company_id: Uuid, invoice_id: Uuid) -> StoreResult<Option<Invoice>> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE company_id = $1 AND invoice_id = $2",
            INVOICE_COLUMNS
        ))
        .bind(company_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn list_invoices_for_lead(&self, company_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {} FROM invoices
            WHERE company_id = $1 AND lead_id = $2
            ORDER BY invoice_date, invoice_number
            "#,
            INVOICE_COLUMNS
        ))
        .bind(company_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    #[instrument(skip(self))]
    async fn list_invoice_line_items(&self, invoice_id: Uuid) -> StoreResult<Vec<InvoiceLineItem>> {
        let items = sqlx::query_as::<_, InvoiceLineItem>(&format!(
            "SELECT {} FROM invoice_line_items WHERE invoice_id = $1 ORDER BY sort_order",
            INVOICE_LINE_ITEM_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    #[instrument(skip(self, link))]
    async fn mark_invoice_sent(
        &self,
        company_id: Uuid,
        invoice_id: Uuid,
        link: &ShareLink,
    ) -> StoreResult<Invoice> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET share_token = $3, share_link_expires_at = $4,
                status = CASE WHEN status = 'draft' THEN 'sent' ELSE status END,
                sent_utc = COALESCE(sent_utc, NOW()),
                updated_utc = NOW()
            WHERE company_id = $1 AND invoice_id = $2
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(company_id)
        .bind(invoice_id)
        .bind(&link.token)
        .bind(link.expires_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("invoice", invoice_id))?;
        Ok(invoice)
    }

    #[instrument(skip(self))]
    async fn cancel_invoice(&self, company_id: Uuid, invoice_id: Uuid) -> StoreResult<Invoice> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET status = 'cancelled', cancelled_utc = NOW(), updated_utc = NOW()
            WHERE company_id = $1 AND invoice_id = $2 AND status <> 'cancelled'
              AND NOT EXISTS (
                  SELECT 1 FROM payments p
                  WHERE p.invoice_id = invoices.invoice_id AND p.deleted_utc IS NULL
              )
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(company_id)
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("invoice", invoice_id))?;
        Ok(invoice)
    }

    #[instrument(skip(self, settlement), fields(status = settlement.status.as_str()))]
    async fn update_invoice_settlement(
        &self,
        invoice_id: Uuid,
        settlement: InvoiceSettlement,
    ) -> StoreResult<Invoice> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET amount_paid = $2, amount_cleared = $3, balance_due = $4, status = $5,
                updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(settlement.amount_paid)
        .bind(settlement.amount_cleared)
        .bind(settlement.balance_due)
        .bind(settlement.status.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("invoice", invoice_id))?;
        Ok(invoice)
    }

    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id, amount = %input.amount))]
    async fn insert_payment(&self, input: &NewPayment) -> StoreResult<Payment> {
        let timer = query_timer("insert_payment");
        // Guarded on the invoice so a concurrent cancel cannot slip in between.
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (payment_id, company_id, invoice_id, lead_id, amount, method,
                payment_date, reference, notes, recorded_by)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            WHERE EXISTS (
                SELECT 1 FROM invoices
                WHERE invoice_id = $3 AND company_id = $2 AND status <> 'cancelled'
            )
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.company_id)
        .bind(input.invoice_id)
        .bind(input.lead_id)
        .bind(input.amount)
        .bind(input.method.as_str())
        .bind(input.payment_date)
        .bind(&input.reference)
        .bind(&input.notes)
        .bind(input.recorded_by)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("invoice", input.invoice_id))?;
        timer.observe_duration();
        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, company_id: Uuid, payment_id: Uuid) -> StoreResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE company_id = $1 AND payment_id = $2",
            PAYMENT_COLUMNS
        ))
        .bind(company_id)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn list_payments_for_invoice(&self, invoice_id: Uuid) -> StoreResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            r#"
            SELECT {} FROM payments
            WHERE invoice_id = $1 AND deleted_utc IS NULL
            ORDER BY payment_date, created_utc
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    #[instrument(skip(self))]
    async fn list_payments_for_lead(&self, company_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            r#"
            SELECT {} FROM payments
            WHERE company_id = $1 AND lead_id = $2 AND deleted_utc IS NULL
            ORDER BY payment_date, created_utc
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(company_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    #[instrument(skip(self))]
    async fn mark_payment_cleared(
        &self,
        company_id: Uuid,
        payment_id: Uuid,
        cleared_at: DateTime<Utc>,
    ) -> StoreResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments
            SET cleared = TRUE, cleared_utc = COALESCE(cleared_utc, $3)
            WHERE company_id = $1 AND payment_id = $2 AND deleted_utc IS NULL
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(company_id)
        .bind(payment_id)
        .bind(cleared_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("payment", payment_id))?;
        Ok(payment)
    }

    #[instrument(skip(self))]
    async fn soft_delete_payment(&self, company_id: Uuid, payment_id: Uuid) -> StoreResult<Payment> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments SET deleted_utc = NOW()
            WHERE company_id = $1 AND payment_id = $2 AND deleted_utc IS NULL
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(company_id)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("payment", payment_id))?;
        Ok(payment)
    }

    #[instrument(skip(self, assignment), fields(lead_id = %assignment.lead_id, role = assignment.role.as_str()))]
    async fn upsert_commission(
        &self,
        assignment: &CommissionAssignment,
        amount: Decimal,
    ) -> StoreResult<Commission> {
        let timer = query_timer("upsert_commission");
        let commission = sqlx::query_as::<_, Commission>(&format!(
            r#"
            INSERT INTO commissions (commission_id, company_id, lead_id, quote_id, role,
                assignee_user_id, paid_when, rate, flat_amount, amount)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (company_id, lead_id, role) DO UPDATE SET
                quote_id = EXCLUDED.quote_id,
                assignee_user_id = EXCLUDED.assignee_user_id,
                paid_when = EXCLUDED.paid_when,
                rate = EXCLUDED.rate,
                flat_amount = EXCLUDED.flat_amount,
                amount = EXCLUDED.amount,
                status = CASE WHEN commissions.status = 'cancelled' THEN 'pending'
                              ELSE commissions.status END,
                cancelled_utc = NULL,
                updated_utc = NOW()
            WHERE commissions.status <> 'paid'
            RETURNING {}
            "#,
            COMMISSION_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(assignment.company_id)
        .bind(assignment.lead_id)
        .bind(assignment.quote_id)
        .bind(assignment.role.as_str())
        .bind(assignment.assignee_user_id)
        .bind(assignment.paid_when.as_str())
        .bind(assignment.rate)
        .bind(assignment.flat_amount)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            StoreError::Conflict(format!(
                "commission for lead {} role {} is already paid",
                assignment.lead_id, assignment.role
            ))
        })?;
        timer.observe_duration();
        Ok(commission)
    }

    #[instrument(skip(self))]
    async fn cancel_other_commissions(
        &self,
        company_id: Uuid,
        lead_id: Uuid,
        keep_role: CommissionRole,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE commissions
            SET status = 'cancelled', cancelled_utc = NOW(), updated_utc = NOW()
            WHERE company_id = $1 AND lead_id = $2 AND role <> $3
              AND status IN ('pending', 'eligible')
            "#,
        )
        .bind(company_id)
        .bind(lead_id)
        .bind(keep_role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn list_commissions(&self, company_id: Uuid, lead_id: Uuid) -> StoreResult<Vec<Commission>> {
        let commissions = sqlx::query_as::<_, Commission>(&format!(
            "SELECT {} FROM commissions WHERE company_id = $1 AND lead_id = $2 ORDER BY created_utc",
            COMMISSION_COLUMNS
        ))
        .bind(company_id)
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(commissions)
    }

    #[instrument(skip(self, update), fields(status = update.status.as_str()))]
    async fn update_commission(
        &self,
        commission_id: Uuid,
        update: CommissionUpdate,
    ) -> StoreResult<Commission> {
        let commission = sqlx::query_as::<_, Commission>(&format!(
            r#"
            UPDATE commissions
            SET amount = $2, status = $3, eligible_utc = $4, updated_utc = NOW()
            WHERE commission_id = $1 AND status IN ('pending', 'eligible')
            RETURNING {}
            "#,
            COMMISSION_COLUMNS
        ))
        .bind(commission_id)
        .bind(update.amount)
        .bind(update.status.as_str())
        .bind(update.eligible_utc)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| conflict("commission", commission_id))?;
        Ok(commission)
    }
}
