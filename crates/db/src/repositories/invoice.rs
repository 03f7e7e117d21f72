use chrono::NaiveDate;
use sqlx::{sqlite::SqliteRow, Row};

use dealgate_core::domain::deal::DealId;
use dealgate_core::domain::invoice::{
    AccountingSystem, Invoice, InvoiceId, InvoiceStaging, InvoiceStagingId, InvoiceStagingStatus,
    StagingLineItem, StagingTax,
};

use super::decode::{parse_date, parse_decimal, parse_json, parse_timestamp, parse_u32};
use super::{InvoiceRepository, RepositoryError};
use crate::DbPool;

pub struct SqlInvoiceRepository {
    pool: DbPool,
}

impl SqlInvoiceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn hydrate(&self, row: SqliteRow) -> Result<InvoiceStaging, RepositoryError> {
        let mut staging = row_to_staging(row)?;

        let line_rows = sqlx::query(
            "SELECT line_number, sku, description, quantity, unit_price, line_total
             FROM invoice_staging_lines
             WHERE staging_id = ?
             ORDER BY line_number ASC",
        )
        .bind(&staging.id.0)
        .fetch_all(&self.pool)
        .await?;
        staging.line_items =
            line_rows.into_iter().map(row_to_line).collect::<Result<_, _>>()?;

        let tax_rows = sqlx::query(
            "SELECT tax_name, tax_rate, taxable_amount, tax_amount, jurisdiction
             FROM invoice_staging_taxes
             WHERE staging_id = ?
             ORDER BY tax_name ASC",
        )
        .bind(&staging.id.0)
        .fetch_all(&self.pool)
        .await?;
        staging.taxes = tax_rows.into_iter().map(row_to_tax).collect::<Result<_, _>>()?;

        Ok(staging)
    }
}

const STAGING_COLUMNS: &str = "id, deal_id, invoice_number, idempotency_key, status, subtotal,
    tax_amount, total_amount, currency, invoice_date, due_date, payment_terms_days,
    target_accounting_system, validation_errors_json, rejection_reason, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, staging_id, deal_id, invoice_number, accounting_system,
    external_invoice_id, subtotal, tax_amount, total_amount, currency, posted_at, posted_by,
    staging_snapshot_json";

/// Decodes the staging row itself; line items and taxes are attached by
/// [`SqlInvoiceRepository::hydrate`].
fn row_to_staging(row: SqliteRow) -> Result<InvoiceStaging, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = InvoiceStagingStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown staging status `{status_raw}`"))
    })?;

    let system_raw = row.try_get::<String, _>("target_accounting_system")?;
    let target_accounting_system = AccountingSystem::parse(&system_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown accounting system `{system_raw}`"))
    })?;

    let errors_raw = row.try_get::<String, _>("validation_errors_json")?;
    let validation_errors: Vec<String> = serde_json::from_str(&errors_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid validation errors: {error}"))
    })?;

    Ok(InvoiceStaging {
        id: InvoiceStagingId(row.try_get("id")?),
        deal_id: DealId(row.try_get("deal_id")?),
        invoice_number: row.try_get("invoice_number")?,
        idempotency_key: row.try_get("idempotency_key")?,
        status,
        subtotal: parse_decimal("subtotal", &row.try_get::<String, _>("subtotal")?)?,
        tax_amount: parse_decimal("tax_amount", &row.try_get::<String, _>("tax_amount")?)?,
        total_amount: parse_decimal("total_amount", &row.try_get::<String, _>("total_amount")?)?,
        currency: row.try_get("currency")?,
        invoice_date: parse_date("invoice_date", &row.try_get::<String, _>("invoice_date")?)?,
        due_date: parse_date("due_date", &row.try_get::<String, _>("due_date")?)?,
        payment_terms_days: parse_u32("payment_terms_days", row.try_get("payment_terms_days")?)?,
        target_accounting_system,
        line_items: Vec::new(),
        taxes: Vec::new(),
        validation_errors,
        rejection_reason: row.try_get("rejection_reason")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn row_to_line(row: SqliteRow) -> Result<StagingLineItem, RepositoryError> {
    Ok(StagingLineItem {
        line_number: parse_u32("line_number", row.try_get("line_number")?)?,
        sku: row.try_get("sku")?,
        description: row.try_get("description")?,
        quantity: parse_decimal("quantity", &row.try_get::<String, _>("quantity")?)?,
        unit_price: parse_decimal("unit_price", &row.try_get::<String, _>("unit_price")?)?,
        line_total: parse_decimal("line_total", &row.try_get::<String, _>("line_total")?)?,
    })
}

fn row_to_tax(row: SqliteRow) -> Result<StagingTax, RepositoryError> {
    Ok(StagingTax {
        tax_name: row.try_get("tax_name")?,
        tax_rate: parse_decimal("tax_rate", &row.try_get::<String, _>("tax_rate")?)?,
        taxable_amount: parse_decimal(
            "taxable_amount",
            &row.try_get::<String, _>("taxable_amount")?,
        )?,
        tax_amount: parse_decimal("tax_amount", &row.try_get::<String, _>("tax_amount")?)?,
        jurisdiction: row.try_get("jurisdiction")?,
    })
}

fn row_to_invoice(row: SqliteRow) -> Result<Invoice, RepositoryError> {
    let system_raw = row.try_get::<String, _>("accounting_system")?;
    let accounting_system = AccountingSystem::parse(&system_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown accounting system `{system_raw}`"))
    })?;

    Ok(Invoice {
        id: InvoiceId(row.try_get("id")?),
        staging_id: InvoiceStagingId(row.try_get("staging_id")?),
        deal_id: DealId(row.try_get("deal_id")?),
        invoice_number: row.try_get("invoice_number")?,
        accounting_system,
        external_invoice_id: row.try_get("external_invoice_id")?,
        subtotal: parse_decimal("subtotal", &row.try_get::<String, _>("subtotal")?)?,
        tax_amount: parse_decimal("tax_amount", &row.try_get::<String, _>("tax_amount")?)?,
        total_amount: parse_decimal("total_amount", &row.try_get::<String, _>("total_amount")?)?,
        currency: row.try_get("currency")?,
        posted_at: parse_timestamp("posted_at", row.try_get("posted_at")?)?,
        posted_by: row.try_get("posted_by")?,
        staging_snapshot: parse_json(
            "staging_snapshot_json",
            &row.try_get::<String, _>("staging_snapshot_json")?,
        )?,
    })
}

#[async_trait::async_trait]
impl InvoiceRepository for SqlInvoiceRepository {
    async fn find_staging(
        &self,
        id: &InvoiceStagingId,
    ) -> Result<Option<InvoiceStaging>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {STAGING_COLUMNS} FROM invoice_staging WHERE id = ?"))
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn staging_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<InvoiceStaging>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {STAGING_COLUMNS} FROM invoice_staging WHERE idempotency_key = ?"
        ))
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn stagings_for_deal(
        &self,
        deal_id: &DealId,
    ) -> Result<Vec<InvoiceStaging>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STAGING_COLUMNS} FROM invoice_staging
             WHERE deal_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&deal_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut stagings = Vec::with_capacity(rows.len());
        for row in rows {
            stagings.push(self.hydrate(row).await?);
        }
        Ok(stagings)
    }

    async fn stagings_created_on(&self, date: NaiveDate) -> Result<u32, RepositoryError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM invoice_staging WHERE invoice_date = ?")
                .bind(date.to_string())
                .fetch_one(&self.pool)
                .await?;

        u32::try_from(count)
            .map_err(|_| RepositoryError::Decode("staging count exceeds u32".to_string()))
    }

    async fn save_staging(&self, staging: InvoiceStaging) -> Result<(), RepositoryError> {
        let validation_errors_json =
            serde_json::to_string(&staging.validation_errors).map_err(|error| {
                RepositoryError::Decode(format!("failed to encode validation errors: {error}"))
            })?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO invoice_staging (
                id, deal_id, invoice_number, idempotency_key, status, subtotal, tax_amount,
                total_amount, currency, invoice_date, due_date, payment_terms_days,
                target_accounting_system, validation_errors_json, rejection_reason,
                created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                invoice_number = excluded.invoice_number,
                status = excluded.status,
                subtotal = excluded.subtotal,
                tax_amount = excluded.tax_amount,
                total_amount = excluded.total_amount,
                currency = excluded.currency,
                invoice_date = excluded.invoice_date,
                due_date = excluded.due_date,
                payment_terms_days = excluded.payment_terms_days,
                target_accounting_system = excluded.target_accounting_system,
                validation_errors_json = excluded.validation_errors_json,
                rejection_reason = excluded.rejection_reason,
                updated_at = excluded.updated_at",
        )
        .bind(&staging.id.0)
        .bind(&staging.deal_id.0)
        .bind(&staging.invoice_number)
        .bind(&staging.idempotency_key)
        .bind(staging.status.as_str())
        .bind(staging.subtotal.to_string())
        .bind(staging.tax_amount.to_string())
        .bind(staging.total_amount.to_string())
        .bind(&staging.currency)
        .bind(staging.invoice_date.to_string())
        .bind(staging.due_date.to_string())
        .bind(i64::from(staging.payment_terms_days))
        .bind(staging.target_accounting_system.as_str())
        .bind(validation_errors_json)
        .bind(staging.rejection_reason.as_deref())
        .bind(staging.created_at.to_rfc3339())
        .bind(staging.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM invoice_staging_lines WHERE staging_id = ?")
            .bind(&staging.id.0)
            .execute(&mut *tx)
            .await?;
        for line in &staging.line_items {
            sqlx::query(
                "INSERT INTO invoice_staging_lines (
                    staging_id, line_number, sku, description, quantity, unit_price, line_total
                 ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&staging.id.0)
            .bind(i64::from(line.line_number))
            .bind(&line.sku)
            .bind(&line.description)
            .bind(line.quantity.to_string())
            .bind(line.unit_price.to_string())
            .bind(line.line_total.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM invoice_staging_taxes WHERE staging_id = ?")
            .bind(&staging.id.0)
            .execute(&mut *tx)
            .await?;
        for tax in &staging.taxes {
            sqlx::query(
                "INSERT INTO invoice_staging_taxes (
                    staging_id, tax_name, tax_rate, taxable_amount, tax_amount, jurisdiction
                 ) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&staging.id.0)
            .bind(&tax.tax_name)
            .bind(tax.tax_rate.to_string())
            .bind(tax.taxable_amount.to_string())
            .bind(tax.tax_amount.to_string())
            .bind(&tax.jurisdiction)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_invoice).transpose()
    }

    async fn invoices_for_deal(&self, deal_id: &DealId) -> Result<Vec<Invoice>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
             WHERE deal_id = ?
             ORDER BY posted_at ASC, id ASC"
        ))
        .bind(&deal_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_invoice).collect()
    }

    async fn save_invoice(&self, invoice: Invoice) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO invoices (
                id, staging_id, deal_id, invoice_number, accounting_system,
                external_invoice_id, subtotal, tax_amount, total_amount, currency,
                posted_at, posted_by, staging_snapshot_json
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&invoice.id.0)
        .bind(&invoice.staging_id.0)
        .bind(&invoice.deal_id.0)
        .bind(&invoice.invoice_number)
        .bind(invoice.accounting_system.as_str())
        .bind(&invoice.external_invoice_id)
        .bind(invoice.subtotal.to_string())
        .bind(invoice.tax_amount.to_string())
        .bind(invoice.total_amount.to_string())
        .bind(&invoice.currency)
        .bind(invoice.posted_at.to_rfc3339())
        .bind(&invoice.posted_by)
        .bind(invoice.staging_snapshot.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
