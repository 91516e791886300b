//! SQL builders for the PostgreSQL statistics catalog.
//!
//! Every statement carries the `/* pgupholder */` marker so the analyzer can
//! exclude the upholder's own workload from its findings. Builders are
//! version-aware where the catalog changed shape between releases.

/// Marker prefix on all catalog SQL issued by the upholder.
pub const SQL_MARKER: &str = "/* pgupholder */";

/// Check for the pg_stat_statements extension.
pub fn build_extension_check_query() -> &'static str {
    "/* pgupholder */ SELECT extversion FROM pg_extension WHERE extname = 'pg_stat_statements'"
}

/// Builds version-aware query for pg_stat_statements.
///
/// PG >= 13 exposes `*_exec_time` columns; older servers use `*_time`.
/// Binds: $1 = min_calls, $2 = top_n.
pub fn build_statement_stats_query(server_version_num: Option<i32>) -> String {
    let v = server_version_num.unwrap_or(0);
    let (total_expr, mean_expr, min_expr, max_expr, stddev_expr) = if v >= 130000 {
        (
            "s.total_exec_time",
            "s.mean_exec_time",
            "s.min_exec_time",
            "s.max_exec_time",
            "s.stddev_exec_time",
        )
    } else {
        (
            "s.total_time",
            "s.mean_time",
            "s.min_time",
            "s.max_time",
            "s.stddev_time",
        )
    };

    format!(
        r#"/* pgupholder */
            SELECT
                s.queryid,
                COALESCE(s.query, '') as query,
                s.calls,
                {total_expr}::double precision as total_ms,
                {mean_expr}::double precision as mean_ms,
                {min_expr}::double precision as min_ms,
                {max_expr}::double precision as max_ms,
                {stddev_expr}::double precision as stddev_ms,
                s.rows,
                COALESCE(s.shared_blks_hit, 0) as shared_blks_hit,
                COALESCE(s.shared_blks_read, 0) as shared_blks_read
            FROM pg_stat_statements s
            WHERE s.calls >= $1
            ORDER BY {mean_expr} DESC
            LIMIT $2
        "#
    )
}

/// Builds query for table profiles from pg_stat_user_tables + pg_class.
///
/// Binds: $1 = schema list. Largest tables first, bounded by the caller's
/// max_tables_per_pass via LIMIT $2.
pub fn build_table_profiles_query() -> &'static str {
    r#"/* pgupholder */
        SELECT
            COALESCE(s.schemaname, '') as schemaname,
            COALESCE(s.relname, '') as relname,
            COALESCE(c.reltuples, 0)::double precision as row_estimate,
            COALESCE(pg_total_relation_size(s.relid), 0)::bigint as total_bytes,
            COALESCE(pg_relation_size(s.relid), 0)::bigint as heap_bytes,
            COALESCE(pg_indexes_size(s.relid), 0)::bigint as index_bytes,
            COALESCE(s.seq_scan, 0)::bigint as seq_scan,
            COALESCE(s.idx_scan, 0)::bigint as idx_scan,
            COALESCE(s.n_tup_upd, 0)::bigint as n_tup_upd,
            COALESCE(s.n_tup_hot_upd, 0)::bigint as n_tup_hot_upd,
            COALESCE(s.n_live_tup, 0)::bigint as n_live_tup,
            COALESCE(s.n_dead_tup, 0)::bigint as n_dead_tup,
            COALESCE(s.n_mod_since_analyze, 0)::bigint as n_mod_since_analyze,
            COALESCE(EXTRACT(EPOCH FROM GREATEST(s.last_analyze, s.last_autoanalyze))::bigint, 0)
                as last_analyze_epoch
        FROM pg_stat_user_tables s
        JOIN pg_class c ON c.oid = s.relid
        WHERE s.schemaname = ANY($1)
        ORDER BY pg_total_relation_size(s.relid) DESC
        LIMIT $2
    "#
}

/// Builds query for index profiles from pg_stat_user_indexes + pg_index.
///
/// Key columns are reassembled in index order via pg_get_indexdef; INCLUDE
/// columns are excluded (indnkeyatts). Binds: $1 = schema list.
pub fn build_index_profiles_query() -> &'static str {
    r#"/* pgupholder */
        SELECT
            COALESCE(i.schemaname, '') as schemaname,
            COALESCE(i.relname, '') as relname,
            COALESCE(i.indexrelname, '') as indexrelname,
            x.indisunique as is_unique,
            x.indisprimary as is_primary,
            x.indisexclusion as is_exclusion,
            (x.indpred IS NOT NULL) as is_partial,
            COALESCE(pg_get_expr(x.indpred, x.indrelid), '') as predicate,
            COALESCE(pg_relation_size(i.indexrelid), 0)::bigint as size_bytes,
            COALESCE(i.idx_scan, 0)::bigint as idx_scan,
            COALESCE(i.idx_tup_read, 0)::bigint as idx_tup_read,
            COALESCE(i.idx_tup_fetch, 0)::bigint as idx_tup_fetch,
            COALESCE(
                (SELECT string_agg(pg_get_indexdef(i.indexrelid, k, true), ',' ORDER BY k)
                 FROM generate_series(1, x.indnkeyatts::int) k),
                ''
            ) as key_columns
        FROM pg_stat_user_indexes i
        JOIN pg_index x ON x.indexrelid = i.indexrelid
        WHERE i.schemaname = ANY($1)
        ORDER BY i.relname, i.indexrelname
    "#
}

/// Heap and index buffer-cache hit ratios across user tables.
pub fn build_cache_ratios_query() -> &'static str {
    r#"/* pgupholder */
        SELECT
            COALESCE(sum(heap_blks_hit), 0)::double precision as heap_hit,
            COALESCE(sum(heap_blks_read), 0)::double precision as heap_read,
            COALESCE(sum(idx_blks_hit), 0)::double precision as idx_hit,
            COALESCE(sum(idx_blks_read), 0)::double precision as idx_read
        FROM pg_statio_user_tables
    "#
}

/// Share of shared_buffers currently holding pages. Requires pg_buffercache.
pub fn build_buffercache_usage_query() -> &'static str {
    r#"/* pgupholder */
        SELECT count(b.relfilenode)::double precision / NULLIF(s.setting::double precision, 0)
        FROM pg_buffercache b
        CROSS JOIN pg_settings s
        WHERE s.name = 'shared_buffers'
        GROUP BY s.setting
    "#
}

/// Builds version-aware query for bgwriter write pressure.
///
/// PG < 17: all counters come from pg_stat_bgwriter.
/// PG 17+:  checkpoint counters moved to pg_stat_checkpointer and
///          buffers_backend moved to pg_stat_io; it is reported as 0 here.
pub fn build_bgwriter_query(server_version_num: Option<i32>) -> String {
    let v = server_version_num.unwrap_or(0);

    if v >= 170000 {
        r#"/* pgupholder */
            SELECT
                COALESCE(c.buffers_written, 0)::bigint AS buffers_checkpoint,
                COALESCE(b.buffers_clean, 0)::bigint AS buffers_clean,
                0::bigint AS buffers_backend,
                COALESCE(b.buffers_alloc, 0)::bigint AS buffers_alloc
            FROM pg_stat_bgwriter b
            CROSS JOIN pg_stat_checkpointer c
        "#
        .to_string()
    } else {
        r#"/* pgupholder */
            SELECT
                COALESCE(buffers_checkpoint, 0)::bigint AS buffers_checkpoint,
                COALESCE(buffers_clean, 0)::bigint AS buffers_clean,
                COALESCE(buffers_backend, 0)::bigint AS buffers_backend,
                COALESCE(buffers_alloc, 0)::bigint AS buffers_alloc
            FROM pg_stat_bgwriter
        "#
        .to_string()
    }
}

/// Row estimates for a set of relations, used when a plan names tables the
/// current audit pass has not profiled. Binds: $1 = relation name list.
pub fn build_relation_rows_query() -> &'static str {
    r#"/* pgupholder */
        SELECT
            COALESCE(n.nspname, '') as schemaname,
            COALESCE(c.relname, '') as relname,
            COALESCE(c.reltuples, 0)::double precision as row_estimate
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE c.relname = ANY($1) AND c.relkind = 'r'
    "#
}

/// Most-common value for one column, as the text form of the stats array.
/// Binds: $1 = table name, $2 = column name.
pub fn build_mcv_query() -> &'static str {
    r#"/* pgupholder */
        SELECT most_common_vals::text
        FROM pg_stats
        WHERE tablename = $1 AND attname = $2
        ORDER BY (schemaname = 'public') DESC
        LIMIT 1
    "#
}

/// Average row width per table from column statistics, for the bloat
/// estimator. Binds: $1 = schema list.
pub fn build_avg_width_query() -> &'static str {
    r#"/* pgupholder */
        SELECT
            tablename,
            COALESCE(sum(avg_width), 0)::double precision as avg_row_width
        FROM pg_stats
        WHERE schemaname = ANY($1)
        GROUP BY tablename
    "#
}
