use tessera_db::{create_pool, run_migrations, DbRuntimeSettings};

#[test]
fn pool_connection_sees_full_schema() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("schema.db");
    let pool = create_pool(path.to_str().expect("utf8"), DbRuntimeSettings::default())
        .expect("pool");
    let conn = pool.get().expect("connection");
    run_migrations(&conn).expect("migrations");

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .expect("prepare");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows");

    assert_eq!(
        tables,
        vec![
            "_tessera_migrations",
            "ephemeral_public_keys",
            "global_threepid_associations",
            "invite_tokens",
            "local_push_cursor",
            "local_threepid_associations",
            "peer_pubkeys",
            "peers",
            "threepid_token_auths",
            "threepid_validation_sessions",
        ]
    );
}

#[test]
fn global_origin_pair_is_unique() {
    let conn = rusqlite::Connection::open_in_memory().expect("open");
    run_migrations(&conn).expect("migrations");

    let insert = "INSERT INTO global_threepid_associations
        (medium, address, mxid, ts, not_before, not_after, origin_server, origin_id, sg_assoc)
        VALUES ('email', 'a@b.c', '@a:b', 1, 1, 2, 'peer', 7, '{}')";
    conn.execute(insert, []).expect("first insert");
    assert!(conn.execute(insert, []).is_err());
}

#[test]
fn validation_session_triple_is_unique() {
    let conn = rusqlite::Connection::open_in_memory().expect("open");
    run_migrations(&conn).expect("migrations");

    let insert = "INSERT INTO threepid_validation_sessions
        (medium, address, client_secret, validated, mtime)
        VALUES ('email', 'a@b.c', 'secret', 0, 1)";
    conn.execute(insert, []).expect("first insert");
    assert!(conn.execute(insert, []).is_err());
}
