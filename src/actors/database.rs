//! The persistence API over the Asagi tables.
//!
//! Two backends with identical observable behavior: MySQL through `mysql_async`, SQLite through
//! `rusqlite`. Schema installation is a separate step; this actor only assumes the `{board}`,
//! `{board}_threads`, and `{board}_images` tables exist.
//!
//! Post rows are upserted keyed on `(num, subnum)` with every other column overwritten on
//! conflict, so a re-observed post always reflects the latest fetch. A thread's post rows and its
//! stats row commit in one transaction.

use std::collections::{HashMap, HashSet};

use actix::prelude::*;
use chrono::prelude::*;
use failure::Fail;
use futures::future::{self, Either};
use futures::prelude::*;
use futures::stream;
use my::prelude::*;
use mysql_async as my;

use crate::asagi::{PostRow, ThreadStatsRow, TimestampExt};
use crate::config::DatabaseConfig;
use crate::four_chan::Board;
use crate::media::ImageRow;

/// Posts per statement batch inside a thread's transaction.
const BATCH_SIZE: usize = 500;

/// How far back an OP still counts as recently active for the missing-thread scan. An hour is a
/// long time for an OP to withstand being deleted by a mod.
const RECENTLY_ACTIVE_WINDOW_SECS: u64 = 3600;

const POST_COLUMNS: &[&str] = &[
    "num",
    "subnum",
    "thread_num",
    "op",
    "timestamp",
    "timestamp_expired",
    "preview_orig",
    "preview_w",
    "preview_h",
    "media_filename",
    "media_w",
    "media_h",
    "media_size",
    "media_hash",
    "media_orig",
    "spoiler",
    "deleted",
    "capcode",
    "name",
    "trip",
    "title",
    "comment",
    "sticky",
    "locked",
    "poster_hash",
    "poster_country",
    "exif",
];
/// `(num, subnum)` lead the column list and are the conflict key.
const POST_KEY_COLUMNS: usize = 2;

const STATS_COLUMNS: &[&str] = &[
    "thread_num",
    "time_op",
    "time_last",
    "time_bump",
    "time_ghost",
    "time_ghost_bump",
    "time_last_modified",
    "nreplies",
    "nimages",
    "sticky",
    "locked",
];

#[derive(Debug, Fail)]
pub enum DbError {
    #[fail(display = "MySQL error: {}", _0)]
    MySql(my::error::Error),

    #[fail(display = "SQLite error: {}", _0)]
    Sqlite(rusqlite::Error),
}

impl From<my::error::Error> for DbError {
    fn from(err: my::error::Error) -> Self {
        DbError::MySql(err)
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        DbError::Sqlite(err)
    }
}

#[derive(Clone, Copy)]
enum Flavor {
    MySql,
    Sqlite,
}

enum Backend {
    MySql(my::Pool),
    Sqlite(rusqlite::Connection),
}

pub struct Database {
    backend: Backend,
    adjust_timestamps: bool,
}

impl Database {
    pub fn new(config: &DatabaseConfig, adjust_timestamps: bool) -> Result<Self, DbError> {
        let backend = match config {
            DatabaseConfig::Mysql { url } => Backend::MySql(my::Pool::new(url.as_str())),
            DatabaseConfig::Sqlite { path } => Backend::Sqlite(rusqlite::Connection::open(path)?),
        };
        Ok(Self {
            backend,
            adjust_timestamps,
        })
    }
}

impl Actor for Database {
    type Context = Context<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Backend::MySql(pool) = &self.backend {
            Arbiter::spawn(
                pool.clone()
                    .disconnect()
                    .map_err(|err| error!("Could not disconnect pool: {}", err)),
            );
        }
    }
}

/// OP numbers of threads whose OP row is younger than the recently-active window and neither
/// deleted nor locked.
pub struct GetActiveThreads(pub Board);
impl Message for GetActiveThreads {
    type Result = Result<HashSet<u64>, DbError>;
}

impl Handler<GetActiveThreads> for Database {
    type Result = ResponseFuture<HashSet<u64>, DbError>;

    fn handle(&mut self, msg: GetActiveThreads, _: &mut Self::Context) -> Self::Result {
        let cutoff = (Utc::now().timestamp() as u64 - RECENTLY_ACTIVE_WINDOW_SECS)
            .adjust(self.adjust_timestamps);
        let sql = format!(
            "SELECT DISTINCT thread_num FROM `{}` \
             WHERE thread_num = num AND deleted = 0 AND locked != 1 AND timestamp > ?",
            msg.0
        );

        match &self.backend {
            Backend::MySql(pool) => Box::new(
                pool.get_conn()
                    .and_then(move |conn| conn.prep_exec(sql, vec![my::Value::from(cutoff)]))
                    .and_then(|result| result.collect_and_drop::<u64>())
                    .map(|(_conn, nums)| nums.into_iter().collect())
                    .from_err(),
            ),
            Backend::Sqlite(conn) => Box::new(future::result(
                sqlite_active_threads(conn, &sql, cutoff).map_err(DbError::from),
            )),
        }
    }
}

/// All stored post numbers of the given threads, in one query.
pub struct GetExistingPostNums(pub Board, pub Vec<u64>);
impl Message for GetExistingPostNums {
    type Result = Result<HashMap<u64, HashSet<u64>>, DbError>;
}

impl Handler<GetExistingPostNums> for Database {
    type Result = ResponseFuture<HashMap<u64, HashSet<u64>>, DbError>;

    fn handle(&mut self, msg: GetExistingPostNums, _: &mut Self::Context) -> Self::Result {
        let GetExistingPostNums(board, thread_nums) = msg;
        if thread_nums.is_empty() {
            return Box::new(future::ok(HashMap::new()));
        }

        let sql = format!(
            "SELECT thread_num, num FROM `{}` WHERE thread_num IN ({})",
            board,
            placeholders(thread_nums.len())
        );

        match &self.backend {
            Backend::MySql(pool) => {
                let params: Vec<my::Value> =
                    thread_nums.iter().map(|&num| my::Value::from(num)).collect();
                Box::new(
                    pool.get_conn()
                        .and_then(move |conn| conn.prep_exec(sql, params))
                        .and_then(|result| {
                            result.reduce_and_drop(
                                HashMap::<u64, HashSet<u64>>::new(),
                                |mut map, row| {
                                    let (thread_num, num): (u64, u64) = my::from_row(row);
                                    map.entry(thread_num).or_insert_with(HashSet::new).insert(num);
                                    map
                                },
                            )
                        })
                        .map(|(_conn, map)| map)
                        .from_err(),
                )
            }
            Backend::Sqlite(conn) => Box::new(future::result(
                sqlite_existing_post_nums(conn, &sql, &thread_nums).map_err(DbError::from),
            )),
        }
    }
}

/// Upsert a thread's post rows (batches of at most [`BATCH_SIZE`]) and its stats row in one
/// transaction.
#[derive(Clone)]
pub struct CommitThread(pub Board, pub Vec<PostRow>, pub Option<ThreadStatsRow>);
impl Message for CommitThread {
    type Result = Result<(), DbError>;
}

impl Handler<CommitThread> for Database {
    type Result = ResponseFuture<(), DbError>;

    fn handle(&mut self, msg: CommitThread, _: &mut Self::Context) -> Self::Result {
        let CommitThread(board, posts, stats) = msg;
        if posts.is_empty() && stats.is_none() {
            return Box::new(future::ok(()));
        }

        match &mut self.backend {
            Backend::MySql(pool) => {
                let insert_sql = upsert_sql(
                    &board.to_string(),
                    POST_COLUMNS,
                    POST_KEY_COLUMNS,
                    "num, subnum",
                    Flavor::MySql,
                );
                let stats_sql = upsert_sql(
                    &format!("{}_threads", board),
                    STATS_COLUMNS,
                    1,
                    "thread_num",
                    Flavor::MySql,
                );

                let chunks: Vec<Vec<Vec<my::Value>>> = posts
                    .chunks(BATCH_SIZE)
                    .map(|chunk| chunk.iter().map(post_values_mysql).collect())
                    .collect();
                let stats_values = stats.as_ref().map(stats_values_mysql);

                Box::new(
                    pool.get_conn()
                        .and_then(|conn| conn.start_transaction(my::TransactionOptions::default()))
                        .and_then(move |tx| {
                            stream::iter_ok::<_, my::error::Error>(chunks)
                                .fold(tx, move |tx, chunk| tx.batch_exec(insert_sql.clone(), chunk))
                        })
                        .and_then(move |tx| match stats_values {
                            Some(values) => Either::A(tx.drop_exec(stats_sql, values)),
                            None => Either::B(future::ok(tx)),
                        })
                        .and_then(|tx| tx.commit())
                        .map(|_conn| ())
                        .from_err(),
                )
            }
            Backend::Sqlite(conn) => Box::new(future::result(
                sqlite_commit_thread(conn, &board, &posts, stats.as_ref()).map_err(DbError::from),
            )),
        }
    }
}

/// Bulk-flag post rows as deleted.
#[derive(Clone)]
pub struct MarkPostsDeleted(pub Board, pub Vec<u64>);
impl Message for MarkPostsDeleted {
    type Result = Result<(), DbError>;
}

impl Handler<MarkPostsDeleted> for Database {
    type Result = ResponseFuture<(), DbError>;

    fn handle(&mut self, msg: MarkPostsDeleted, _: &mut Self::Context) -> Self::Result {
        let sql = format!(
            "UPDATE `{}` SET deleted = 1 WHERE num IN ({})",
            msg.0,
            placeholders(msg.1.len())
        );
        self.bulk_update(sql, msg.1)
    }
}

/// Bulk-flag OPs of moderator-deleted threads.
#[derive(Clone)]
pub struct MarkThreadsDeleted(pub Board, pub Vec<u64>);
impl Message for MarkThreadsDeleted {
    type Result = Result<(), DbError>;
}

impl Handler<MarkThreadsDeleted> for Database {
    type Result = ResponseFuture<(), DbError>;

    fn handle(&mut self, msg: MarkThreadsDeleted, _: &mut Self::Context) -> Self::Result {
        let sql = format!(
            "UPDATE `{}` SET deleted = 1 WHERE num IN ({})",
            msg.0,
            placeholders(msg.1.len())
        );
        self.bulk_update(sql, msg.1)
    }
}

/// Bulk-flag OPs of remotely archived threads as locked.
#[derive(Clone)]
pub struct MarkThreadsArchived(pub Board, pub Vec<u64>);
impl Message for MarkThreadsArchived {
    type Result = Result<(), DbError>;
}

impl Handler<MarkThreadsArchived> for Database {
    type Result = ResponseFuture<(), DbError>;

    fn handle(&mut self, msg: MarkThreadsArchived, _: &mut Self::Context) -> Self::Result {
        let sql = format!(
            "UPDATE `{}` SET locked = 1 WHERE num IN ({}) AND thread_num = num",
            msg.0,
            placeholders(msg.1.len())
        );
        self.bulk_update(sql, msg.1)
    }
}

/// Stored filename and ban status for each known hash among the given ones.
pub struct GetImageRows(pub Board, pub Vec<String>);
impl Message for GetImageRows {
    type Result = Result<HashMap<String, ImageRow>, DbError>;
}

impl Handler<GetImageRows> for Database {
    type Result = ResponseFuture<HashMap<String, ImageRow>, DbError>;

    fn handle(&mut self, msg: GetImageRows, _: &mut Self::Context) -> Self::Result {
        let GetImageRows(board, hashes) = msg;
        if hashes.is_empty() {
            return Box::new(future::ok(HashMap::new()));
        }

        let sql = format!(
            "SELECT media_hash, media, banned FROM `{}_images` WHERE media_hash IN ({})",
            board,
            placeholders(hashes.len())
        );

        match &self.backend {
            Backend::MySql(pool) => {
                let params: Vec<my::Value> =
                    hashes.iter().map(|hash| my::Value::from(hash.as_str())).collect();
                Box::new(
                    pool.get_conn()
                        .and_then(move |conn| conn.prep_exec(sql, params))
                        .and_then(|result| {
                            result.reduce_and_drop(HashMap::new(), |mut map, row| {
                                let (hash, media, banned): (String, Option<String>, bool) =
                                    my::from_row(row);
                                map.insert(hash, ImageRow { media, banned });
                                map
                            })
                        })
                        .map(|(_conn, map)| map)
                        .from_err(),
                )
            }
            Backend::Sqlite(conn) => Box::new(future::result(
                sqlite_image_rows(conn, &sql, &hashes).map_err(DbError::from),
            )),
        }
    }
}

/// Record a completed full-media download: `total` incremented, the stored filename kept if one
/// already exists.
pub struct RecordImage(pub Board, pub String, pub String);
impl Message for RecordImage {
    type Result = Result<(), DbError>;
}

impl Handler<RecordImage> for Database {
    type Result = ResponseFuture<(), DbError>;

    fn handle(&mut self, msg: RecordImage, _: &mut Self::Context) -> Self::Result {
        let RecordImage(board, hash, media) = msg;
        let table = format!("{}_images", board);

        match &self.backend {
            Backend::MySql(pool) => {
                let sql = format!(
                    "INSERT INTO `{}` (media_hash, media, total, banned) VALUES (?, ?, 1, 0) \
                     ON DUPLICATE KEY UPDATE total = total + 1, media = COALESCE(media, VALUES(media))",
                    table
                );
                let params = vec![my::Value::from(hash), my::Value::from(media)];
                Box::new(
                    pool.get_conn()
                        .and_then(move |conn| conn.drop_exec(sql, params))
                        .map(|_conn| ())
                        .from_err(),
                )
            }
            Backend::Sqlite(conn) => {
                let sql = format!(
                    "INSERT INTO `{}` (media_hash, media, total, banned) VALUES (?, ?, 1, 0) \
                     ON CONFLICT(media_hash) DO UPDATE SET total = total + 1, \
                     media = COALESCE(media, excluded.media)",
                    table
                );
                let result = conn
                    .execute(
                        &sql,
                        rusqlite::params_from_iter(vec![
                            rusqlite::types::Value::Text(hash),
                            rusqlite::types::Value::Text(media),
                        ]),
                    )
                    .map(|_| ())
                    .map_err(DbError::from);
                Box::new(future::result(result))
            }
        }
    }
}

impl Database {
    fn bulk_update(&mut self, sql: String, nums: Vec<u64>) -> ResponseFuture<(), DbError> {
        if nums.is_empty() {
            return Box::new(future::ok(()));
        }

        match &self.backend {
            Backend::MySql(pool) => {
                let params: Vec<my::Value> = nums.iter().map(|&num| my::Value::from(num)).collect();
                Box::new(
                    pool.get_conn()
                        .and_then(move |conn| conn.drop_exec(sql, params))
                        .map(|_conn| ())
                        .from_err(),
                )
            }
            Backend::Sqlite(conn) => {
                let values: Vec<rusqlite::types::Value> = nums
                    .iter()
                    .map(|&num| rusqlite::types::Value::Integer(num as i64))
                    .collect();
                let result = conn
                    .execute(&sql, rusqlite::params_from_iter(values))
                    .map(|_| ())
                    .map_err(DbError::from);
                Box::new(future::result(result))
            }
        }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn upsert_sql(
    table: &str,
    columns: &[&str],
    key_columns: usize,
    conflict_target: &str,
    flavor: Flavor,
) -> String {
    let cols = columns.join(", ");
    let values = placeholders(columns.len());
    let updates: Vec<String> = columns[key_columns..]
        .iter()
        .map(|col| match flavor {
            Flavor::MySql => format!("{} = VALUES({})", col, col),
            Flavor::Sqlite => format!("{} = excluded.{}", col, col),
        })
        .collect();

    match flavor {
        Flavor::MySql => format!(
            "INSERT INTO `{}` ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            table,
            cols,
            values,
            updates.join(", ")
        ),
        Flavor::Sqlite => format!(
            "INSERT INTO `{}` ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
            table,
            cols,
            values,
            conflict_target,
            updates.join(", ")
        ),
    }
}

fn post_values_mysql(row: &PostRow) -> Vec<my::Value> {
    vec![
        row.num.into(),
        row.subnum.into(),
        row.thread_num.into(),
        row.op.into(),
        row.timestamp.into(),
        row.timestamp_expired.into(),
        row.preview_orig.clone().into(),
        row.preview_w.into(),
        row.preview_h.into(),
        row.media_filename.clone().into(),
        row.media_w.into(),
        row.media_h.into(),
        row.media_size.into(),
        row.media_hash.clone().into(),
        row.media_orig.clone().into(),
        row.spoiler.into(),
        row.deleted.into(),
        row.capcode.clone().into(),
        row.name.clone().into(),
        row.trip.clone().into(),
        row.title.clone().into(),
        row.comment.clone().into(),
        row.sticky.into(),
        row.locked.into(),
        row.poster_hash.clone().into(),
        row.poster_country.clone().into(),
        row.exif.clone().into(),
    ]
}

fn stats_values_mysql(row: &ThreadStatsRow) -> Vec<my::Value> {
    vec![
        row.thread_num.into(),
        row.time_op.into(),
        row.time_last.into(),
        row.time_bump.into(),
        row.time_ghost.into(),
        row.time_ghost_bump.into(),
        row.time_last_modified.into(),
        row.nreplies.into(),
        row.nimages.into(),
        row.sticky.into(),
        row.locked.into(),
    ]
}

fn sql_integer(n: u64) -> rusqlite::types::Value {
    rusqlite::types::Value::Integer(n as i64)
}

fn sql_opt_integer(n: Option<u64>) -> rusqlite::types::Value {
    match n {
        Some(n) => sql_integer(n),
        None => rusqlite::types::Value::Null,
    }
}

fn sql_bool(b: bool) -> rusqlite::types::Value {
    rusqlite::types::Value::Integer(b as i64)
}

fn sql_text(text: &Option<String>) -> rusqlite::types::Value {
    match text {
        Some(text) => rusqlite::types::Value::Text(text.clone()),
        None => rusqlite::types::Value::Null,
    }
}

fn post_values_sqlite(row: &PostRow) -> Vec<rusqlite::types::Value> {
    vec![
        sql_integer(row.num),
        sql_integer(row.subnum),
        sql_integer(row.thread_num),
        sql_bool(row.op),
        sql_integer(row.timestamp),
        sql_integer(row.timestamp_expired),
        sql_text(&row.preview_orig),
        sql_integer(u64::from(row.preview_w)),
        sql_integer(u64::from(row.preview_h)),
        sql_text(&row.media_filename),
        sql_integer(u64::from(row.media_w)),
        sql_integer(u64::from(row.media_h)),
        sql_integer(u64::from(row.media_size)),
        sql_text(&row.media_hash),
        sql_text(&row.media_orig),
        sql_bool(row.spoiler),
        sql_bool(row.deleted),
        rusqlite::types::Value::Text(row.capcode.clone()),
        sql_text(&row.name),
        sql_text(&row.trip),
        sql_text(&row.title),
        sql_text(&row.comment),
        sql_bool(row.sticky),
        sql_bool(row.locked),
        sql_text(&row.poster_hash),
        sql_text(&row.poster_country),
        sql_text(&row.exif),
    ]
}

fn stats_values_sqlite(row: &ThreadStatsRow) -> Vec<rusqlite::types::Value> {
    vec![
        sql_integer(row.thread_num),
        sql_integer(row.time_op),
        sql_integer(row.time_last),
        sql_integer(row.time_bump),
        sql_opt_integer(row.time_ghost),
        sql_opt_integer(row.time_ghost_bump),
        sql_integer(row.time_last_modified),
        sql_integer(row.nreplies),
        sql_integer(row.nimages),
        sql_bool(row.sticky),
        sql_bool(row.locked),
    ]
}

fn sqlite_active_threads(
    conn: &rusqlite::Connection,
    sql: &str,
    cutoff: u64,
) -> rusqlite::Result<HashSet<u64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([cutoff as i64], |row| row.get::<_, i64>(0))?;
    let mut nums = HashSet::new();
    for num in rows {
        nums.insert(num? as u64);
    }
    Ok(nums)
}

fn sqlite_existing_post_nums(
    conn: &rusqlite::Connection,
    sql: &str,
    thread_nums: &[u64],
) -> rusqlite::Result<HashMap<u64, HashSet<u64>>> {
    let values: Vec<rusqlite::types::Value> =
        thread_nums.iter().map(|&num| sql_integer(num)).collect();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut map: HashMap<u64, HashSet<u64>> = HashMap::new();
    for row in rows {
        let (thread_num, num) = row?;
        map.entry(thread_num as u64)
            .or_insert_with(HashSet::new)
            .insert(num as u64);
    }
    Ok(map)
}

fn sqlite_image_rows(
    conn: &rusqlite::Connection,
    sql: &str,
    hashes: &[String],
) -> rusqlite::Result<HashMap<String, ImageRow>> {
    let values: Vec<rusqlite::types::Value> = hashes
        .iter()
        .map(|hash| rusqlite::types::Value::Text(hash.clone()))
        .collect();
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(values), |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, i64>(2)? != 0,
        ))
    })?;

    let mut map = HashMap::new();
    for row in rows {
        let (hash, media, banned) = row?;
        map.insert(hash, ImageRow { media, banned });
    }
    Ok(map)
}

fn sqlite_commit_thread(
    conn: &mut rusqlite::Connection,
    board: &Board,
    posts: &[PostRow],
    stats: Option<&ThreadStatsRow>,
) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let sql = upsert_sql(
            &board.to_string(),
            POST_COLUMNS,
            POST_KEY_COLUMNS,
            "num, subnum",
            Flavor::Sqlite,
        );
        let mut stmt = tx.prepare(&sql)?;
        for row in posts {
            stmt.execute(rusqlite::params_from_iter(post_values_sqlite(row)))?;
        }

        if let Some(stats) = stats {
            let stats_sql = upsert_sql(
                &format!("{}_threads", board),
                STATS_COLUMNS,
                1,
                "thread_num",
                Flavor::Sqlite,
            );
            tx.execute(&stats_sql, rusqlite::params_from_iter(stats_values_sqlite(stats)))?;
        }
    }
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::four_chan::Post;

    fn test_conn(board: &str) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(&format!(
            "CREATE TABLE `{b}` (
                num INTEGER NOT NULL, subnum INTEGER NOT NULL, thread_num INTEGER NOT NULL,
                op INTEGER NOT NULL, timestamp INTEGER NOT NULL, timestamp_expired INTEGER,
                preview_orig TEXT, preview_w INTEGER, preview_h INTEGER, media_filename TEXT,
                media_w INTEGER, media_h INTEGER, media_size INTEGER, media_hash TEXT,
                media_orig TEXT, spoiler INTEGER, deleted INTEGER NOT NULL DEFAULT 0,
                capcode TEXT, name TEXT, trip TEXT, title TEXT, comment TEXT,
                sticky INTEGER, locked INTEGER NOT NULL DEFAULT 0, poster_hash TEXT,
                poster_country TEXT, exif TEXT,
                PRIMARY KEY (num, subnum)
            );
            CREATE TABLE `{b}_threads` (
                thread_num INTEGER PRIMARY KEY, time_op INTEGER, time_last INTEGER,
                time_bump INTEGER, time_ghost INTEGER, time_ghost_bump INTEGER,
                time_last_modified INTEGER, nreplies INTEGER, nimages INTEGER,
                sticky INTEGER, locked INTEGER
            );
            CREATE TABLE `{b}_images` (
                media_id INTEGER PRIMARY KEY AUTOINCREMENT, media_hash TEXT UNIQUE NOT NULL,
                media TEXT, preview_op TEXT, preview_reply TEXT,
                total INTEGER NOT NULL DEFAULT 0, banned INTEGER NOT NULL DEFAULT 0
            );",
            b = board
        ))
        .unwrap();
        conn
    }

    fn board() -> Board {
        Board::new("po").unwrap()
    }

    fn row(no: u64, resto: u64, comment: &str) -> PostRow {
        let post: Post = serde_json::from_str(&format!(
            r#"{{"no": {}, "resto": {}, "time": 1571420000, "com": "{}"}}"#,
            no, resto, comment
        ))
        .unwrap();
        PostRow::from_post(&post, false)
    }

    fn count(conn: &rusqlite::Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn commit_thread_is_idempotent() {
        let mut conn = test_conn("po");
        let posts = vec![row(100, 0, "op"), row(105, 100, "reply")];

        sqlite_commit_thread(&mut conn, &board(), &posts, None).unwrap();
        sqlite_commit_thread(&mut conn, &board(), &posts, None).unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM `po`"), 2);
    }

    #[test]
    fn upsert_overwrites_columns_on_conflict() {
        let mut conn = test_conn("po");
        sqlite_commit_thread(&mut conn, &board(), &[row(100, 0, "first")], None).unwrap();
        sqlite_commit_thread(&mut conn, &board(), &[row(100, 0, "edited")], None).unwrap();

        let comment: String = conn
            .query_row("SELECT comment FROM `po` WHERE num = 100", [], |r| r.get(0))
            .unwrap();
        assert_eq!(comment, "edited");
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM `po`"), 1);
    }

    #[test]
    fn reobserving_a_deleted_post_revives_it() {
        let mut conn = test_conn("po");
        sqlite_commit_thread(&mut conn, &board(), &[row(100, 0, "op")], None).unwrap();
        conn.execute("UPDATE `po` SET deleted = 1 WHERE num = 100", []).unwrap();

        sqlite_commit_thread(&mut conn, &board(), &[row(100, 0, "op")], None).unwrap();
        assert_eq!(count(&conn, "SELECT deleted FROM `po` WHERE num = 100"), 0);
    }

    #[test]
    fn stats_row_upserts_by_thread_num() {
        let mut conn = test_conn("po");
        let stats = ThreadStatsRow {
            thread_num: 100,
            time_op: 1_571_420_000,
            time_last: 1_571_425_000,
            time_bump: 1_571_425_000,
            time_ghost: None,
            time_ghost_bump: None,
            time_last_modified: 1_571_426_000,
            nreplies: 5,
            nimages: 1,
            sticky: false,
            locked: false,
        };
        sqlite_commit_thread(&mut conn, &board(), &[], Some(&stats)).unwrap();

        let mut newer = stats.clone();
        newer.nreplies = 7;
        newer.time_last = 1_571_430_000;
        sqlite_commit_thread(&mut conn, &board(), &[], Some(&newer)).unwrap();

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM `po_threads`"), 1);
        assert_eq!(
            count(&conn, "SELECT nreplies FROM `po_threads` WHERE thread_num = 100"),
            7
        );
    }

    #[test]
    fn existing_post_nums_grouped_by_thread() {
        let mut conn = test_conn("po");
        let posts = vec![row(100, 0, "op"), row(105, 100, "a"), row(106, 100, "b")];
        sqlite_commit_thread(&mut conn, &board(), &posts, None).unwrap();
        sqlite_commit_thread(&mut conn, &board(), &[row(200, 0, "other")], None).unwrap();

        let sql = format!(
            "SELECT thread_num, num FROM `po` WHERE thread_num IN ({})",
            placeholders(2)
        );
        let map = sqlite_existing_post_nums(&conn, &sql, &[100, 200]).unwrap();
        assert_eq!(map[&100].len(), 3);
        assert!(map[&100].contains(&106));
        assert_eq!(map[&200].len(), 1);
    }

    #[test]
    fn active_threads_respect_flags_and_cutoff() {
        let mut conn = test_conn("po");
        sqlite_commit_thread(
            &mut conn,
            &board(),
            &[row(100, 0, "live"), row(200, 0, "locked"), row(300, 0, "gone")],
            None,
        )
        .unwrap();
        conn.execute("UPDATE `po` SET locked = 1 WHERE num = 200", []).unwrap();
        conn.execute("UPDATE `po` SET deleted = 1 WHERE num = 300", []).unwrap();

        let sql = "SELECT DISTINCT thread_num FROM `po` \
                   WHERE thread_num = num AND deleted = 0 AND locked != 1 AND timestamp > ?";
        let active = sqlite_active_threads(&conn, sql, 1_571_000_000).unwrap();
        assert_eq!(active, [100u64].iter().cloned().collect());

        // Everything is older than a cutoff in the future.
        let none = sqlite_active_threads(&conn, sql, 1_600_000_000).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn image_rows_and_record_image() {
        let conn = test_conn("po");
        let upsert = "INSERT INTO `po_images` (media_hash, media, total, banned) VALUES (?, ?, 1, 0) \
                      ON CONFLICT(media_hash) DO UPDATE SET total = total + 1, \
                      media = COALESCE(media, excluded.media)";

        let hash = "rl2m2jcoQVkkBVZUqpJTVA==";
        for _ in 0..2 {
            conn.execute(
                upsert,
                rusqlite::params_from_iter(vec![
                    rusqlite::types::Value::Text(hash.to_string()),
                    rusqlite::types::Value::Text("1717755968123.jpg".to_string()),
                ]),
            )
            .unwrap();
        }
        assert_eq!(
            count(&conn, "SELECT total FROM `po_images` WHERE media_hash = 'rl2m2jcoQVkkBVZUqpJTVA=='"),
            2
        );
        // The first stored filename wins.
        conn.execute(
            upsert,
            rusqlite::params_from_iter(vec![
                rusqlite::types::Value::Text(hash.to_string()),
                rusqlite::types::Value::Text("9999999999999.jpg".to_string()),
            ]),
        )
        .unwrap();
        let media: String = conn
            .query_row("SELECT media FROM `po_images` WHERE media_hash = ?", [hash], |r| r.get(0))
            .unwrap();
        assert_eq!(media, "1717755968123.jpg");

        conn.execute(
            "INSERT INTO `po_images` (media_hash, media, total, banned) VALUES ('banned==hash==banned====', NULL, 0, 1)",
            [],
        )
        .unwrap();

        let sql = format!(
            "SELECT media_hash, media, banned FROM `po_images` WHERE media_hash IN ({})",
            placeholders(2)
        );
        let rows = sqlite_image_rows(
            &conn,
            &sql,
            &[hash.to_string(), "banned==hash==banned====".to_string()],
        )
        .unwrap();
        assert!(!rows[hash].banned);
        assert_eq!(rows[hash].media.as_deref(), Some("1717755968123.jpg"));
        assert!(rows["banned==hash==banned===="].banned);
        assert!(rows["banned==hash==banned===="].media.is_none());
    }

    #[test]
    fn upsert_sql_flavors() {
        let mysql = upsert_sql("po_threads", STATS_COLUMNS, 1, "thread_num", Flavor::MySql);
        assert!(mysql.starts_with("INSERT INTO `po_threads`"));
        assert!(mysql.contains("ON DUPLICATE KEY UPDATE"));
        assert!(mysql.contains("nreplies = VALUES(nreplies)"));
        assert!(!mysql.contains("thread_num = VALUES(thread_num)"));

        let sqlite = upsert_sql("po_threads", STATS_COLUMNS, 1, "thread_num", Flavor::Sqlite);
        assert!(sqlite.contains("ON CONFLICT(thread_num) DO UPDATE SET"));
        assert!(sqlite.contains("nreplies = excluded.nreplies"));
        assert!(!sqlite.contains("thread_num = excluded.thread_num"));
    }
}
