use super::models::*;
use crate::rules;
use sqlx::PgPool;
use std::str::FromStr;
use time::OffsetDateTime;

/// Typed access to the catalog. Each method owns a single statement or
/// transaction; callers never see raw SQL.
#[derive(Clone)]
pub struct CatalogRepo {
    pool: PgPool,
}

impl CatalogRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // -- singletons, per spec.md §9 "Global state" --------------------------

    /// Get-or-create the system configuration singleton (fixed id = 1).
    pub async fn load_system_configuration(&self) -> Result<SystemConfiguration, sqlx::Error> {
        sqlx::query_as::<_, SystemConfiguration>(
            "insert into system_configuration (id, base_url, client_id, upload_endpoint, \
             status_endpoint, download_endpoint, notify_endpoint, token_refresh_endpoint, \
             ingest_root, pull_start_at, study_date_based_filtering) \
             values (1, '', '', '', '', '', '', '', '', now(), false) \
             on conflict (id) do nothing; \
             select * from system_configuration where id = 1",
        )
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_system_configuration(&self) -> Result<Option<SystemConfiguration>, sqlx::Error> {
        sqlx::query_as::<_, SystemConfiguration>("select * from system_configuration where id = 1")
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn update_bearer_token(
        &self,
        bearer_token: &str,
        refresh_token: Option<&str>,
        token_expiry: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update system_configuration set bearer_token = $1, \
             refresh_token = coalesce($2, refresh_token), token_expiry = $3 where id = 1",
        )
        .bind(bearer_token)
        .bind(refresh_token)
        .bind(token_expiry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_scp_config(&self) -> Result<DicomScpConfig, sqlx::Error> {
        sqlx::query_as::<_, DicomScpConfig>("select * from dicom_scp_config where id = 1")
            .fetch_one(&self.pool)
            .await
    }

    // -- chain lock, per spec.md §4.9 ----------------------------------------

    /// Conditionally claim the named chain lock: insert if absent, or
    /// reclaim in place if the existing row is expired. Single statement to
    /// avoid the read-then-write race spec.md §5 warns against.
    pub async fn try_acquire_chain_lock(
        &self,
        name: &str,
        chain_id: &str,
        started_by: &str,
        ttl_seconds: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "insert into chain_lock (name, chain_id, started_at, started_by, expires_at, status) \
             values ($1, $2, now(), $3, now() + ($4 || ' seconds')::interval, 'RUNNING') \
             on conflict (name) do update set \
               chain_id = excluded.chain_id, started_at = excluded.started_at, \
               started_by = excluded.started_by, expires_at = excluded.expires_at, \
               status = excluded.status \
             where chain_lock.expires_at < now()",
        )
        .bind(name)
        .bind(chain_id)
        .bind(started_by)
        .bind(ttl_seconds.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release_chain_lock(&self, name: &str) -> Result<(), sqlx::Error> {
        sqlx::query("update chain_lock set status = 'IDLE' where name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- series state machine, per spec.md §4.4 ------------------------------

    pub async fn transition_series(
        &self,
        series_id: i64,
        next: ProcessingStatus,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let current: (ProcessingStatus,) =
            sqlx::query_as("select processing_status from series where id = $1 for update")
                .bind(series_id)
                .fetch_one(&mut *tx)
                .await?;
        if current.0.transition(next).is_err() {
            tx.rollback().await?;
            return Err(sqlx::Error::Protocol(format!(
                "invalid series transition {:?} -> {:?}",
                current.0, next
            )));
        }
        sqlx::query("update series set processing_status = $1 where id = $2")
            .bind(next)
            .bind(series_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn series_in_status(
        &self,
        status: ProcessingStatus,
    ) -> Result<Vec<Series>, sqlx::Error> {
        sqlx::query_as::<_, Series>("select * from series where processing_status = $1")
            .bind(status)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn exports_pending_poll(&self) -> Result<Vec<ExportRecord>, sqlx::Error> {
        sqlx::query_as::<_, ExportRecord>(
            "select * from export_record where transfer_status = 'COMPLETED' \
             and coalesce(server_segmentation_status, '') not in ('Delivered to Client', 'Transfer Completed')",
        )
        .fetch_all(&self.pool)
        .await
    }

    // -- transaction log, per spec.md §3 "Transaction log" (append-only) ----

    /// Batch-insert transaction log rows using a dynamically-generated
    /// placeholder list, so a burst of C-STOREs costs one statement.
    pub async fn insert_transaction_log_batch(
        &self,
        rows: &[TransactionLogRow],
    ) -> Result<(), sqlx::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "insert into transaction_log \
                 (type, status, calling_ae, called_ae, remote_ip, remote_port, patient_id, \
                  study_uid, series_uid, sop_instance_uid, sop_class_uid, file_path, file_size, \
                  transfer_syntax, duration_s, transfer_speed_mbps, error, timestamp) \
                 values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17, now())",
            )
            .bind(row.transaction_type)
            .bind(row.status)
            .bind(&row.calling_ae)
            .bind(&row.called_ae)
            .bind(&row.remote_ip)
            .bind(row.remote_port)
            .bind(&row.patient_id)
            .bind(&row.study_uid)
            .bind(&row.series_uid)
            .bind(&row.sop_instance_uid)
            .bind(&row.sop_class_uid)
            .bind(&row.file_path)
            .bind(row.file_size)
            .bind(&row.transfer_syntax)
            .bind(row.duration_s)
            .bind(row.transfer_speed_mbps)
            .bind(&row.error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // -- storage-usage cache, per spec.md §4.10 ------------------------------

    pub async fn increment_cached_storage(&self, delta_bytes: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update service_status set cached_storage_bytes = cached_storage_bytes + $1, \
             cached_storage_updated_at = now() where id = 1",
        )
        .bind(delta_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_cached_storage(&self, actual_bytes: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update service_status set cached_storage_bytes = $1, cached_storage_updated_at = now() \
             where id = 1",
        )
        .bind(actual_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- ingest upserts, per spec.md §4.3 "Idempotence" ----------------------

    pub async fn upsert_patient(&self, patient_id: &str, deidentified_id: &str) -> Result<i64, sqlx::Error> {
        let (id,): (i64,) = sqlx::query_as(
            "insert into patient (patient_id, deidentified_id) values ($1, $2) \
             on conflict (patient_id) do update set patient_id = excluded.patient_id \
             returning id",
        )
        .bind(patient_id)
        .bind(deidentified_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn upsert_study(&self, patient_row_id: i64, study_uid: &str, deidentified_study_uid: &str) -> Result<i64, sqlx::Error> {
        let (id,): (i64,) = sqlx::query_as(
            "insert into study (patient_id, study_uid, deidentified_study_uid) values ($1, $2, $3) \
             on conflict (study_uid) do update set study_uid = excluded.study_uid \
             returning id",
        )
        .bind(patient_row_id)
        .bind(study_uid)
        .bind(deidentified_study_uid)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn upsert_series(
        &self,
        study_row_id: i64,
        series_uid: &str,
        deidentified_series_uid: &str,
        root_path: &str,
    ) -> Result<i64, sqlx::Error> {
        let (id,): (i64,) = sqlx::query_as(
            "insert into series (study_id, series_uid, deidentified_series_uid, root_path, \
             instance_count, fully_read_flag, processing_status, matched_ruleset_ids, matched_template_ids) \
             values ($1, $2, $3, $4, 0, false, 'UNPROCESSED', '{}', '{}') \
             on conflict (series_uid) do update set series_uid = excluded.series_uid \
             returning id",
        )
        .bind(study_row_id)
        .bind(series_uid)
        .bind(deidentified_series_uid)
        .bind(root_path)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// No-op if the instance's SOP Instance UID is already present, per
    /// spec.md §4.3 "Idempotence".
    pub async fn upsert_instance(
        &self,
        series_row_id: i64,
        sop_instance_uid: &str,
        deidentified_sop_instance_uid: &str,
        file_path: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "insert into instance (series_id, sop_instance_uid, deidentified_sop_instance_uid, file_path) \
             values ($1, $2, $3, $4) on conflict (sop_instance_uid) do nothing",
        )
        .bind(series_row_id)
        .bind(sop_instance_uid)
        .bind(deidentified_sop_instance_uid)
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set the series' Frame-of-Reference UID pair the first time an
    /// instance carrying one is seen; a no-op on every later call so the
    /// value the deidentify/reidentify round-trip relies on never changes
    /// mid-series.
    pub async fn set_series_frame_of_reference(
        &self,
        series_row_id: i64,
        frame_of_reference_uid: &str,
        deidentified_frame_of_reference_uid: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update series set \
             frame_of_reference_uid = coalesce(frame_of_reference_uid, $2), \
             deidentified_frame_of_reference_uid = coalesce(deidentified_frame_of_reference_uid, $3) \
             where id = $1",
        )
        .bind(series_row_id)
        .bind(frame_of_reference_uid)
        .bind(deidentified_frame_of_reference_uid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Current `(instance_count, max_mtime)` snapshot, used by the scanner's
    /// stability check across passes, per spec.md §4.3 "Stability".
    pub async fn series_instance_count(&self, series_row_id: i64) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("select count(*) from instance where series_id = $1")
            .bind(series_row_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn mark_fully_read(&self, series_row_id: i64, instance_count: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update series set fully_read_flag = true, fully_read_at = now(), \
             instance_count = $2, \
             processing_status = case when processing_status = 'UNPROCESSED' then 'UNPROCESSED' else processing_status end \
             where id = $1",
        )
        .bind(series_row_id)
        .bind(instance_count as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_export_record(
        &self,
        series_id: i64,
        zip_path: &str,
        zip_sha256: &str,
    ) -> Result<i64, sqlx::Error> {
        let (id,): (i64,) = sqlx::query_as(
            "insert into export_record (series_id, zip_path, zip_sha256, transfer_status) \
             values ($1, $2, $3, 'PENDING') returning id",
        )
        .bind(series_id)
        .bind(zip_path)
        .bind(zip_sha256)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn mark_export_uploaded(&self, export_id: i64, task_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update export_record set transfer_status = 'COMPLETED', transferred_at = now(), \
             server_task_id = $2 where id = $1",
        )
        .bind(export_id)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_export_failed(&self, export_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("update export_record set transfer_status = 'FAILED' where id = $1")
            .bind(export_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Idempotent per series id: a poll retried after a non-success notify
    /// reuses this row instead of inserting a duplicate, per spec.md §4.7
    /// step (g).
    pub async fn insert_import_record(
        &self,
        series_id: i64,
        downloaded_path: &camino::Utf8Path,
        received_sha256: &str,
    ) -> Result<i64, sqlx::Error> {
        let (id,): (i64,) = sqlx::query_as(
            "insert into import_record (series_id, downloaded_path, received_sha256, received_at) \
             values ($1, $2, $3, now()) \
             on conflict (series_id) do update set \
                downloaded_path = excluded.downloaded_path, \
                received_sha256 = excluded.received_sha256, \
                received_at = excluded.received_at \
             returning id",
        )
        .bind(series_id)
        .bind(downloaded_path.as_str())
        .bind(received_sha256)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Step (a) of spec.md §4.7: record the remote task's current status on
    /// every poll, independent of whether it has reached a terminal value.
    pub async fn update_export_server_status(
        &self,
        export_id: i64,
        status: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update export_record set server_segmentation_status = $2, \
             server_status_updated_at = now() where id = $1",
        )
        .bind(export_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal Export disposition for a poll-stage integrity/format failure,
    /// per spec.md §4.7 (c)/(d) and §7 IntegrityFailure/FormatInvalid.
    pub async fn mark_export_transfer_status(
        &self,
        export_id: i64,
        status: TransferStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("update export_record set transfer_status = $2 where id = $1")
            .bind(export_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_export_rtstruct_received(&self, export_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update export_record set server_segmentation_status = 'RTStructure Received', \
             transfer_status = 'RTSTRUCT_RECEIVED' where id = $1",
        )
        .bind(export_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_reidentified(
        &self,
        import_id: i64,
        reidentified_path: &camino::Utf8Path,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update import_record set reidentified_path = $2, reidentified_at = now() where id = $1",
        )
        .bind(import_id)
        .bind(reidentified_path.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_voi(&self, import_id: i64, volume_name: &str) -> Result<(), sqlx::Error> {
        sqlx::query("insert into voi_record (import_id, volume_name, modification_types) values ($1, $2, '{}')")
            .bind(import_id)
            .bind(volume_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn latest_import_for_series(&self, series_id: i64) -> Result<Option<ImportRecord>, sqlx::Error> {
        sqlx::query_as::<_, ImportRecord>(
            "select * from import_record where series_id = $1 order by received_at desc limit 1",
        )
        .bind(series_id)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn series_by_id(&self, series_id: i64) -> Result<Series, sqlx::Error> {
        sqlx::query_as::<_, Series>("select * from series where id = $1")
            .bind(series_id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn patient_for_series(&self, series_id: i64) -> Result<Patient, sqlx::Error> {
        sqlx::query_as::<_, Patient>(
            "select p.* from patient p \
             join study st on st.patient_id = p.id \
             join series se on se.study_id = st.id \
             where se.id = $1",
        )
        .bind(series_id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn study_for_series(&self, series_id: i64) -> Result<Study, sqlx::Error> {
        sqlx::query_as::<_, Study>(
            "select st.* from study st join series se on se.study_id = st.id where se.id = $1",
        )
        .bind(series_id)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn instances_for_series(&self, series_id: i64) -> Result<Vec<Instance>, sqlx::Error> {
        sqlx::query_as::<_, Instance>("select * from instance where series_id = $1 order by file_path")
            .bind(series_id)
            .fetch_all(&self.pool)
            .await
    }

    // -- rule engine tree, per spec.md §3 "RuleGroup -> RuleSet -> Rule" ------

    /// Load the full RuleGroup tree, ordered within each RuleSet and within
    /// each RuleGroup per the `order_index` columns, ready for
    /// `rules::evaluate_series`.
    pub async fn load_rule_groups(&self) -> Result<Vec<rules::RuleGroup>, sqlx::Error> {
        let group_rows = sqlx::query_as::<_, RuleGroupRow>("select * from rule_group order by id")
            .fetch_all(&self.pool)
            .await?;
        let mut groups = Vec::with_capacity(group_rows.len());
        for group_row in group_rows {
            let ruleset_rows = sqlx::query_as::<_, RuleSetRow>(
                "select * from rule_set where rule_group_id = $1 order by order_index",
            )
            .bind(group_row.id)
            .fetch_all(&self.pool)
            .await?;

            let mut rulesets = Vec::with_capacity(ruleset_rows.len());
            for ruleset_row in ruleset_rows {
                let rule_rows = sqlx::query_as::<_, RuleRow>(
                    "select * from rule where rule_set_id = $1 order by order_index",
                )
                .bind(ruleset_row.id)
                .fetch_all(&self.pool)
                .await?;

                let rules = rule_rows
                    .into_iter()
                    .filter_map(|r| {
                        Some(rules::Rule {
                            tag_key: r.tag_key,
                            operator: crate::vr::Operator::from_str(&r.operator).ok()?,
                            literal: r.literal,
                            vr: crate::vr::VrCode::from_str(&r.vr).ok()?,
                            combinator_with_next: rules::Combinator::from_str(&r.combinator_with_next).ok()?,
                        })
                    })
                    .collect();

                rulesets.push(rules::RuleSet {
                    id: ruleset_row.id,
                    rules,
                    combinator_with_next: rules::Combinator::from_str(&ruleset_row.combinator_with_next)
                        .unwrap_or(rules::Combinator::And),
                });
            }

            groups.push(rules::RuleGroup {
                id: group_row.id,
                template_ids: group_row.template_ids,
                rulesets,
            });
        }
        Ok(groups)
    }

    /// Persist a series' rule-match outcome: status plus the matched
    /// ruleset/template id sets, per spec.md §4.2 "Series outcome".
    pub async fn record_rule_match(
        &self,
        series_id: i64,
        matched_ruleset_ids: &[i64],
        matched_template_ids: &[i64],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update series set matched_ruleset_ids = $2, matched_template_ids = $3 where id = $1",
        )
        .bind(series_id)
        .bind(matched_ruleset_ids)
        .bind(matched_template_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn active_remote_nodes(&self) -> Result<Vec<RemoteDicomNode>, sqlx::Error> {
        sqlx::query_as::<_, RemoteDicomNode>(
            "select * from remote_dicom_node where is_active = true and allow_incoming = true",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn remote_node_by_ae_title(
        &self,
        ae_title: &str,
    ) -> Result<Option<RemoteDicomNode>, sqlx::Error> {
        sqlx::query_as::<_, RemoteDicomNode>(
            "select * from remote_dicom_node where ae_title = $1 and is_active = true",
        )
        .bind(ae_title)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn touch_remote_node_incoming(&self, ae_title: &str) -> Result<(), sqlx::Error> {
        sqlx::query("update remote_dicom_node set last_incoming_at = now() where ae_title = $1")
            .bind(ae_title)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_remote_node_outgoing(&self, ae_title: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update remote_dicom_node set last_successful_outgoing_at = now() where ae_title = $1",
        )
        .bind(ae_title)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- C-FIND candidate rows, per spec.md §4.11 "Query/Retrieve" -----------
    //
    // Each level returns every row the catalog holds; the caller (c_find.rs)
    // narrows by translating the identifier's wildcard keys into a regex and
    // filtering in memory, since Postgres `like` doesn't speak DICOM's `*`/`?`
    // wildcard grammar directly. The optional exact-match parameters below are
    // just a coarse index-friendly pre-filter on the hierarchical scoping key.

    pub async fn find_rows_patient_level(&self) -> Result<Vec<FindRow>, sqlx::Error> {
        sqlx::query_as::<_, FindRow>(
            "select p.patient_id, p.name as patient_name, \
             null::text as study_uid, null::text as study_date, null::text as study_description, \
             null::text as accession, null::text as study_id, \
             null::text as series_uid, null::text as series_description, null::text as modality, \
             null::text as sop_instance_uid, null::text as file_path \
             from patient p",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn find_rows_study_level(
        &self,
        patient_id: Option<&str>,
    ) -> Result<Vec<FindRow>, sqlx::Error> {
        sqlx::query_as::<_, FindRow>(
            "select p.patient_id, p.name as patient_name, \
             st.study_uid, st.study_date, st.description as study_description, \
             st.accession, st.study_id, \
             null::text as series_uid, null::text as series_description, null::text as modality, \
             null::text as sop_instance_uid, null::text as file_path \
             from study st join patient p on p.id = st.patient_id \
             where $1::text is null or p.patient_id = $1",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn find_rows_series_level(
        &self,
        study_uid: Option<&str>,
    ) -> Result<Vec<FindRow>, sqlx::Error> {
        sqlx::query_as::<_, FindRow>(
            "select p.patient_id, p.name as patient_name, \
             st.study_uid, st.study_date, st.description as study_description, \
             st.accession, st.study_id, \
             se.series_uid, se.description as series_description, st.modality, \
             null::text as sop_instance_uid, null::text as file_path \
             from series se \
             join study st on st.id = se.study_id \
             join patient p on p.id = st.patient_id \
             where $1::text is null or st.study_uid = $1",
        )
        .bind(study_uid)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn find_rows_image_level(
        &self,
        series_uid: Option<&str>,
    ) -> Result<Vec<FindRow>, sqlx::Error> {
        sqlx::query_as::<_, FindRow>(
            "select p.patient_id, p.name as patient_name, \
             st.study_uid, st.study_date, st.description as study_description, \
             st.accession, st.study_id, \
             se.series_uid, se.description as series_description, st.modality, \
             i.sop_instance_uid, i.file_path \
             from instance i \
             join series se on se.id = i.series_id \
             join study st on st.id = se.study_id \
             join patient p on p.id = st.patient_id \
             where $1::text is null or se.series_uid = $1",
        )
        .bind(series_uid)
        .fetch_all(&self.pool)
        .await
    }

    // -- C-MOVE / C-GET retrieval, per spec.md §4.11 -------------------------

    pub async fn instance_locations_for_patient(
        &self,
        patient_id: &str,
    ) -> Result<Vec<InstanceLocation>, sqlx::Error> {
        sqlx::query_as::<_, InstanceLocation>(
            "select i.file_path, i.sop_instance_uid, null::text as sop_class_uid, \
             se.series_uid, st.study_uid, p.patient_id \
             from instance i \
             join series se on se.id = i.series_id \
             join study st on st.id = se.study_id \
             join patient p on p.id = st.patient_id \
             where p.patient_id = $1 \
             order by i.file_path",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn instance_locations_for_study(
        &self,
        study_uid: &str,
    ) -> Result<Vec<InstanceLocation>, sqlx::Error> {
        sqlx::query_as::<_, InstanceLocation>(
            "select i.file_path, i.sop_instance_uid, null::text as sop_class_uid, \
             se.series_uid, st.study_uid, p.patient_id \
             from instance i \
             join series se on se.id = i.series_id \
             join study st on st.id = se.study_id \
             join patient p on p.id = st.patient_id \
             where st.study_uid = $1 \
             order by i.file_path",
        )
        .bind(study_uid)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn instance_locations_for_series(
        &self,
        series_uid: &str,
    ) -> Result<Vec<InstanceLocation>, sqlx::Error> {
        sqlx::query_as::<_, InstanceLocation>(
            "select i.file_path, i.sop_instance_uid, null::text as sop_class_uid, \
             se.series_uid, st.study_uid, p.patient_id \
             from instance i \
             join series se on se.id = i.series_id \
             join study st on st.id = se.study_id \
             join patient p on p.id = st.patient_id \
             where se.series_uid = $1 \
             order by i.file_path",
        )
        .bind(series_uid)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn instance_location_for_sop(
        &self,
        sop_instance_uid: &str,
    ) -> Result<Option<InstanceLocation>, sqlx::Error> {
        sqlx::query_as::<_, InstanceLocation>(
            "select i.file_path, i.sop_instance_uid, null::text as sop_class_uid, \
             se.series_uid, st.study_uid, p.patient_id \
             from instance i \
             join series se on se.id = i.series_id \
             join study st on st.id = se.study_id \
             join patient p on p.id = st.patient_id \
             where i.sop_instance_uid = $1",
        )
        .bind(sop_instance_uid)
        .fetch_optional(&self.pool)
        .await
    }

    // -- storage/retention cleanup, per spec.md §4.10 "Cleanup" --------------

    /// Series whose instances are all older than the retention cutoff and
    /// have already been exported (or failed export terminally), i.e. safe
    /// to delete from local storage.
    pub async fn series_eligible_for_cleanup(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<Series>, sqlx::Error> {
        sqlx::query_as::<_, Series>(
            "select se.* from series se \
             where se.fully_read_at is not null and se.fully_read_at < $1 \
             and se.processing_status in \
               ('RTSTRUCTURE_EXPORTED', 'RULE_NOT_MATCHED', 'DEIDENTIFICATION_FAILED', \
                'FAILED_TRANSFER_TO_DRAW_SERVER', 'INVALID_RTSTRUCTURE_RECEIVED')",
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn delete_instances_for_series(&self, series_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("delete from instance where series_id = $1")
            .bind(series_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -- service status, per spec.md §3 "ServiceStatus" ----------------------

    pub async fn mark_service_started(&self, pid: i32) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update service_status set is_running = true, pid = $1, started_at = now(), \
             stopped_at = null where id = 1",
        )
        .bind(pid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_service_stopped(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update service_status set is_running = false, stopped_at = now(), \
             active_connections = 0 where id = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_connection_opened(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update service_status set total_connections = total_connections + 1, \
             active_connections = active_connections + 1, last_connection_at = now() where id = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_connection_closed(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update service_status set active_connections = greatest(active_connections - 1, 0) \
             where id = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_file_received(&self, file_size: i64) -> Result<(), sqlx::Error> {
        sqlx::query(
            "update service_status set total_files_received = total_files_received + 1, \
             total_bytes_received = total_bytes_received + $1, last_file_received_at = now() \
             where id = 1",
        )
        .bind(file_size)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_error(&self) -> Result<(), sqlx::Error> {
        sqlx::query("update service_status set total_errors = total_errors + 1 where id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_service_status(&self) -> Result<ServiceStatus, sqlx::Error> {
        sqlx::query_as::<_, ServiceStatus>("select * from service_status where id = 1")
            .fetch_one(&self.pool)
            .await
    }

    // -- statistics sampler, per spec.md §4.10 "Periodic sampling" -----------

    pub async fn insert_statistics_sample(
        &self,
        parameter_name: &str,
        parameter_value: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "insert into statistics_sample (parameter_name, parameter_value) values ($1, $2)",
        )
        .bind(parameter_name)
        .bind(parameter_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
