//! PostgreSQL store.
//!
//! Each unit runs in one database transaction. The booking row is locked with
//! `FOR UPDATE` and the release itself is a compare-and-set on
//! `escrow_released`; the wallet credit is an atomic increment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgExecutor, Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use escrowsettle_common::{
    Booking, BookingId, BookingStatus, Cancellation, ClientId, Currency, Dispute, DisputeId,
    DisputeStatus, EscrowError, Money, PreconditionReason, ProviderId, ReleaseCheck, Result,
    TransactionId, UserType,
};
use escrowsettle_ledger::{upsert_credit, ProviderWallet, Transaction, TransactionMetadata};

use super::{
    AutoReleaseHold, DisputeCommand, DisputeCommit, ReleaseCommand, ReleaseCommit,
    SettlementStore, WorkCompletedCommand,
};

const SCHEMA: &str = include_str!("schema.sql");

const BOOKING_COLUMNS: &str = "id, client_id, provider_id, status, total_amount, \
    commission_amount, provider_amount, currency, is_paid, escrow_released, completed_at, \
    client_confirm_deadline, client_confirmed_at, cancelled_at, cancelled_by, \
    cancellation_reason, created_at, updated_at";

const WALLET_COLUMNS: &str = "provider_id, balance, currency, can_withdraw, created_at, updated_at";

type PgTransaction<'c> = sqlx::Transaction<'c, Postgres>;

fn db_err(err: sqlx::Error) -> EscrowError {
    EscrowError::Persistence(err.to_string())
}

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(db_err)?;

        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(db_err)?;

        info!("Database connection verified");
        Ok(Self { pool })
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        info!("Database schema ensured");
        Ok(())
    }

    async fn lock_booking(
        tx: &mut PgTransaction<'_>,
        booking_id: BookingId,
    ) -> Result<Booking> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(booking_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or(EscrowError::BookingNotFound(booking_id))?;
        booking_from_row(&row)
    }

    async fn dispute_exists<'e>(
        executor: impl PgExecutor<'e>,
        booking_id: BookingId,
    ) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM disputes WHERE booking_id = $1)",
        )
        .bind(booking_id.as_uuid())
        .fetch_one(executor)
        .await
        .map_err(db_err)
    }

    async fn credit_wallet(
        tx: &mut PgTransaction<'_>,
        provider_id: &ProviderId,
        credit: &Money,
        now: DateTime<Utc>,
    ) -> Result<ProviderWallet> {
        let sql = format!(
            "SELECT {WALLET_COLUMNS} FROM provider_wallets WHERE provider_id = $1 FOR UPDATE"
        );
        let existing = sqlx::query(&sql)
            .bind(provider_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .map(|row| wallet_from_row(&row))
            .transpose()?;

        // Validates currency and amount before touching the row.
        upsert_credit(existing, provider_id, credit, now)?;

        let sql = format!(
            "INSERT INTO provider_wallets ({WALLET_COLUMNS}) \
             VALUES ($1, $2, $3, TRUE, $4, $4) \
             ON CONFLICT (provider_id) DO UPDATE \
             SET balance = provider_wallets.balance + EXCLUDED.balance, \
                 updated_at = EXCLUDED.updated_at \
             WHERE provider_wallets.currency = EXCLUDED.currency \
             RETURNING {WALLET_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(provider_id.as_str())
            .bind(credit.value)
            .bind(credit.currency.code())
            .bind(now)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| {
                EscrowError::Persistence(format!(
                    "wallet upsert for {provider_id} matched no row"
                ))
            })?;
        wallet_from_row(&row)
    }
}

#[async_trait]
impl SettlementStore for PgStore {
    async fn insert_booking(&self, booking: &Booking) -> Result<()> {
        let sql = format!(
            "INSERT INTO bookings ({BOOKING_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        );
        let cancellation = booking.cancellation.as_ref();
        sqlx::query(&sql)
            .bind(booking.id.as_uuid())
            .bind(booking.client_id.as_str())
            .bind(booking.provider_id.as_str())
            .bind(booking.status.as_str())
            .bind(booking.total_amount)
            .bind(booking.commission_amount)
            .bind(booking.provider_amount)
            .bind(booking.currency.code())
            .bind(booking.is_paid)
            .bind(booking.escrow_released)
            .bind(booking.completed_at)
            .bind(booking.client_confirm_deadline)
            .bind(booking.client_confirmed_at)
            .bind(cancellation.map(|c| c.cancelled_at))
            .bind(cancellation.map(|c| c.cancelled_by.as_str()))
            .bind(cancellation.and_then(|c| c.reason.clone()))
            .bind(booking.created_at)
            .bind(booking.updated_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_booking(&self, booking_id: BookingId) -> Result<Option<Booking>> {
        let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1");
        sqlx::query(&sql)
            .bind(booking_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| booking_from_row(&row))
            .transpose()
    }

    async fn get_dispute(&self, booking_id: BookingId) -> Result<Option<Dispute>> {
        sqlx::query(
            "SELECT id, booking_id, raised_by, raised_by_type, reason, status, resolution, \
             created_at, resolved_at FROM disputes WHERE booking_id = $1",
        )
        .bind(booking_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| dispute_from_row(&row))
        .transpose()
    }

    async fn get_wallet(&self, provider_id: &ProviderId) -> Result<Option<ProviderWallet>> {
        let sql = format!("SELECT {WALLET_COLUMNS} FROM provider_wallets WHERE provider_id = $1");
        sqlx::query(&sql)
            .bind(provider_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .map(|row| wallet_from_row(&row))
            .transpose()
    }

    async fn transactions_for_booking(&self, booking_id: BookingId) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            "SELECT id, booking_id, user_id, user_type, type, amount, currency, status, \
             metadata, created_at FROM transactions WHERE booking_id = $1 ORDER BY created_at, id",
        )
        .bind(booking_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn find_auto_release_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BookingId>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT b.id FROM bookings b \
             WHERE b.status = 'AWAITING_CLIENT_CONFIRMATION' \
               AND b.is_paid \
               AND b.escrow_released = FALSE \
               AND b.client_confirm_deadline IS NOT NULL \
               AND b.client_confirm_deadline <= $1 \
               AND NOT EXISTS (SELECT 1 FROM disputes d WHERE d.booking_id = b.id) \
               AND NOT EXISTS (SELECT 1 FROM auto_release_holds h WHERE h.booking_id = b.id) \
             ORDER BY b.client_confirm_deadline, b.id \
             LIMIT $2",
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(ids.into_iter().map(BookingId::from_uuid).collect())
    }

    async fn commit_work_completed(&self, command: &WorkCompletedCommand) -> Result<Booking> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut booking = Self::lock_booking(&mut tx, command.booking_id).await?;

        if booking.provider_id != command.provider_id {
            return Err(EscrowError::Unauthorized {
                booking_id: booking.id,
                actor: command.provider_id.to_string(),
            });
        }
        if booking.status != BookingStatus::InProgress {
            return Err(EscrowError::precondition(
                booking.id,
                PreconditionReason::WrongStatus {
                    expected: BookingStatus::InProgress,
                    actual: booking.status,
                },
            ));
        }
        booking.mark_work_completed(command.now, command.confirmation_window)?;

        let updated = sqlx::query(
            "UPDATE bookings SET status = $2, completed_at = $3, \
             client_confirm_deadline = COALESCE(client_confirm_deadline, $4), updated_at = $5 \
             WHERE id = $1 AND status = 'IN_PROGRESS'",
        )
        .bind(booking.id.as_uuid())
        .bind(booking.status.as_str())
        .bind(booking.completed_at)
        .bind(booking.client_confirm_deadline)
        .bind(booking.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            return Err(EscrowError::Persistence(format!(
                "booking {} changed status during update",
                booking.id
            )));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(booking)
    }

    async fn commit_release(&self, command: &ReleaseCommand) -> Result<ReleaseCommit> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let booking = Self::lock_booking(&mut tx, command.booking_id).await?;
        let has_dispute = Self::dispute_exists(&mut *tx, booking.id).await?;

        if booking.check_release(has_dispute)? == ReleaseCheck::AlreadySettled {
            tx.rollback().await.map_err(db_err)?;
            return Ok(ReleaseCommit::AlreadySettled { booking });
        }

        let breakdown = booking.settlement_breakdown(command.default_commission_rate);
        let mut released = booking.clone();
        released.apply_release(command.now)?;

        let updated = sqlx::query(
            "UPDATE bookings SET status = 'COMPLETED', escrow_released = TRUE, \
             client_confirmed_at = $2, updated_at = $3 \
             WHERE id = $1 \
               AND escrow_released = FALSE \
               AND status = 'AWAITING_CLIENT_CONFIRMATION' \
               AND is_paid \
               AND NOT EXISTS (SELECT 1 FROM disputes d WHERE d.booking_id = bookings.id)",
        )
        .bind(booking.id.as_uuid())
        .bind(released.client_confirmed_at)
        .bind(released.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            debug!(booking_id = %booking.id, "Escrow compare-and-set matched no row");
            let current = self
                .get_booking(booking.id)
                .await?
                .ok_or(EscrowError::BookingNotFound(booking.id))?;
            let has_dispute = Self::dispute_exists(&self.pool, booking.id).await?;
            return resolve_missed_release(current, has_dispute);
        }

        let transaction =
            Transaction::escrow_release(&booking, &breakdown, command.reason, command.now);
        sqlx::query(
            "INSERT INTO transactions (id, booking_id, user_id, user_type, type, amount, \
             currency, status, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(transaction.id.as_uuid())
        .bind(transaction.booking_id.as_uuid())
        .bind(&transaction.user_id)
        .bind(transaction.user_type.as_str())
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.amount)
        .bind(transaction.currency.code())
        .bind(transaction.status.as_str())
        .bind(Json(&transaction.metadata))
        .bind(transaction.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let credit = Money::new(breakdown.provider_amount, booking.currency.clone());
        let wallet =
            Self::credit_wallet(&mut tx, &booking.provider_id, &credit, command.now).await?;

        tx.commit().await.map_err(db_err)?;

        Ok(ReleaseCommit::Released {
            booking: released,
            transaction,
            wallet,
        })
    }

    async fn commit_dispute(&self, command: &DisputeCommand) -> Result<DisputeCommit> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut booking = Self::lock_booking(&mut tx, command.booking_id).await?;
        let has_dispute = Self::dispute_exists(&mut *tx, booking.id).await?;

        booking.check_dispute(has_dispute)?;
        booking.apply_dispute(command.now)?;

        sqlx::query("UPDATE bookings SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(booking.id.as_uuid())
            .bind(booking.status.as_str())
            .bind(booking.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let dispute = Dispute::open(
            booking.id,
            command.raised_by.clone(),
            command.raised_by_type,
            command.reason.clone(),
            command.now,
        );
        sqlx::query(
            "INSERT INTO disputes (id, booking_id, raised_by, raised_by_type, reason, status, \
             resolution, created_at, resolved_at) VALUES ($1, $2, $3, $4, $5, $6, NULL, $7, NULL)",
        )
        .bind(dispute.id.as_uuid())
        .bind(dispute.booking_id.as_uuid())
        .bind(&dispute.raised_by)
        .bind(dispute.raised_by_type.as_str())
        .bind(&dispute.reason)
        .bind(dispute.status.as_str())
        .bind(dispute.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(DisputeCommit { booking, dispute })
    }

    async fn hold_auto_release(&self, hold: &AutoReleaseHold) -> Result<()> {
        let inserted = sqlx::query(
            "INSERT INTO auto_release_holds (booking_id, error_code, message, held_at) \
             SELECT $1, $2, $3, $4 WHERE EXISTS (SELECT 1 FROM bookings WHERE id = $1) \
             ON CONFLICT (booking_id) DO UPDATE \
             SET error_code = EXCLUDED.error_code, message = EXCLUDED.message, \
                 held_at = EXCLUDED.held_at",
        )
        .bind(hold.booking_id.as_uuid())
        .bind(&hold.error_code)
        .bind(&hold.message)
        .bind(hold.held_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            return Err(EscrowError::BookingNotFound(hold.booking_id));
        }
        Ok(())
    }

    async fn get_auto_release_hold(
        &self,
        booking_id: BookingId,
    ) -> Result<Option<AutoReleaseHold>> {
        sqlx::query(
            "SELECT booking_id, error_code, message, held_at FROM auto_release_holds \
             WHERE booking_id = $1",
        )
        .bind(booking_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(|row| hold_from_row(&row))
        .transpose()
    }

    async fn clear_auto_release_hold(&self, booking_id: BookingId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM auto_release_holds WHERE booking_id = $1")
            .bind(booking_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(deleted.rows_affected() > 0)
    }
}

/// Decide what a compare-and-set that matched no row means, from the state
/// read after the rollback. Only an already released escrow is a no-op; a
/// dispute or status change committed in between is a precondition failure.
fn resolve_missed_release(current: Booking, has_dispute: bool) -> Result<ReleaseCommit> {
    match current.check_release(has_dispute)? {
        ReleaseCheck::AlreadySettled => Ok(ReleaseCommit::AlreadySettled { booking: current }),
        ReleaseCheck::Eligible => Err(EscrowError::Persistence(format!(
            "escrow compare-and-set for booking {} matched no row",
            current.id
        ))),
    }
}

/// Split the schema script into executable statements.
fn schema_statements(script: &str) -> impl Iterator<Item = &str> {
    script
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
}

fn parse_user_type(value: &str) -> Result<UserType> {
    UserType::parse(value).ok_or_else(|| EscrowError::Persistence(format!(
        "unknown user type in store: {value}"
    )))
}

fn booking_from_row(row: &PgRow) -> Result<Booking> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let cancelled_at: Option<DateTime<Utc>> = row.try_get("cancelled_at").map_err(db_err)?;
    let cancelled_by: Option<String> = row.try_get("cancelled_by").map_err(db_err)?;

    let cancellation = match (cancelled_at, cancelled_by) {
        (Some(cancelled_at), Some(by)) => Some(Cancellation {
            cancelled_at,
            cancelled_by: parse_user_type(&by)?,
            reason: row.try_get("cancellation_reason").map_err(db_err)?,
        }),
        _ => None,
    };

    Ok(Booking {
        id: BookingId::from_uuid(row.try_get("id").map_err(db_err)?),
        client_id: ClientId::new(row.try_get::<String, _>("client_id").map_err(db_err)?),
        provider_id: ProviderId::new(row.try_get::<String, _>("provider_id").map_err(db_err)?),
        status: status.parse()?,
        total_amount: row.try_get("total_amount").map_err(db_err)?,
        commission_amount: row.try_get("commission_amount").map_err(db_err)?,
        provider_amount: row.try_get("provider_amount").map_err(db_err)?,
        currency: Currency::new(row.try_get::<String, _>("currency").map_err(db_err)?),
        is_paid: row.try_get("is_paid").map_err(db_err)?,
        escrow_released: row.try_get("escrow_released").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        client_confirm_deadline: row.try_get("client_confirm_deadline").map_err(db_err)?,
        client_confirmed_at: row.try_get("client_confirmed_at").map_err(db_err)?,
        cancellation,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn dispute_from_row(row: &PgRow) -> Result<Dispute> {
    let raised_by_type: String = row.try_get("raised_by_type").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;

    Ok(Dispute {
        id: DisputeId::from_uuid(row.try_get("id").map_err(db_err)?),
        booking_id: BookingId::from_uuid(row.try_get("booking_id").map_err(db_err)?),
        raised_by: row.try_get("raised_by").map_err(db_err)?,
        raised_by_type: parse_user_type(&raised_by_type)?,
        reason: row.try_get("reason").map_err(db_err)?,
        status: status.parse::<DisputeStatus>()?,
        resolution: row.try_get("resolution").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        resolved_at: row.try_get("resolved_at").map_err(db_err)?,
    })
}

fn wallet_from_row(row: &PgRow) -> Result<ProviderWallet> {
    Ok(ProviderWallet {
        provider_id: ProviderId::new(row.try_get::<String, _>("provider_id").map_err(db_err)?),
        balance: row.try_get::<Decimal, _>("balance").map_err(db_err)?,
        currency: Currency::new(row.try_get::<String, _>("currency").map_err(db_err)?),
        can_withdraw: row.try_get("can_withdraw").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn hold_from_row(row: &PgRow) -> Result<AutoReleaseHold> {
    Ok(AutoReleaseHold {
        booking_id: BookingId::from_uuid(row.try_get("booking_id").map_err(db_err)?),
        error_code: row.try_get("error_code").map_err(db_err)?,
        message: row.try_get("message").map_err(db_err)?,
        held_at: row.try_get("held_at").map_err(db_err)?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let user_type: String = row.try_get("user_type").map_err(db_err)?;
    let transaction_type: String = row.try_get("type").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let Json(metadata): Json<TransactionMetadata> = row.try_get("metadata").map_err(db_err)?;

    Ok(Transaction {
        id: TransactionId::from_uuid(row.try_get("id").map_err(db_err)?),
        booking_id: BookingId::from_uuid(row.try_get("booking_id").map_err(db_err)?),
        user_id: row.try_get("user_id").map_err(db_err)?,
        user_type: parse_user_type(&user_type)?,
        transaction_type: transaction_type.parse()?,
        amount: row.try_get("amount").map_err(db_err)?,
        currency: Currency::new(row.try_get::<String, _>("currency").map_err(db_err)?),
        status: status.parse()?,
        metadata,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}
