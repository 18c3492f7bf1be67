#![cfg(test)]

use serde_json;

use super::*;

fn reply(no: u64) -> Post {
    serde_json::from_str(&format!(
        r#"{{"no": {}, "resto": 100, "time": 1571430000, "com": "reply"}}"#,
        no
    ))
    .unwrap()
}

fn op_with_image() -> Post {
    serde_json::from_str(
        r#"{
            "no": 100,
            "resto": 0,
            "time": 1571420000,
            "sticky": 0,
            "closed": 0,
            "name": "Anonymous",
            "sub": "catalog &amp; thread",
            "com": "first <br> post",
            "filename": "landscape",
            "ext": ".jpg",
            "tim": 1571420000123,
            "fsize": 123456,
            "md5": "rl2m2jcoQVkkBVZUqpJTVA==",
            "w": 1920,
            "h": 1080,
            "tn_w": 250,
            "tn_h": 140,
            "unique_ips": 31,
            "semantic_url": "ignored-unknown-field"
        }"#,
    )
    .unwrap()
}

#[test]
fn deserialize_post_with_image() {
    let post = op_with_image();
    assert!(post.is_op());
    assert_eq!(post.thread_no(), 100);
    assert_eq!(post.unique_ips, Some(31));

    let image = post.image.as_ref().unwrap();
    assert_eq!(image.ext, ".jpg");
    assert_eq!(image.time_millis, 1_571_420_000_123);
    assert_eq!(image.filesize, 123_456);
    assert!(!image.spoiler);

    assert!(post.validate().is_ok());
}

#[test]
fn deserialize_post_without_image() {
    let post = reply(105);
    assert!(post.image.is_none());
    assert_eq!(post.thread_no(), 100);
    assert!(post.validate().is_ok());
}

#[test]
fn deserialize_post_with_removed_file() {
    // A mod-deleted file leaves `filedeleted` behind without any of the other file fields.
    let post: Post = serde_json::from_str(
        r#"{"no": 105, "resto": 100, "time": 1571421000, "filedeleted": 1}"#,
    )
    .unwrap();
    assert!(post.image.is_none());
    assert!(post.file_deleted);
    assert!(post.validate().is_ok());
}

#[test]
fn deserialize_catalog_thread() {
    let thread: CatalogThread = serde_json::from_str(
        r#"{
            "no": 100,
            "resto": 0,
            "time": 1571420000,
            "last_modified": 1571430000,
            "replies": 7,
            "images": 2,
            "last_replies": [
                {"no": 106, "resto": 100, "time": 1571429000},
                {"no": 107, "resto": 100, "time": 1571430000}
            ]
        }"#,
    )
    .unwrap();
    assert_eq!(thread.no(), 100);
    assert_eq!(thread.replies, 7);
    assert_eq!(thread.last_replies.len(), 2);
    assert_eq!(thread.bump_time(), 1_571_430_000);
    assert!(thread.validate().is_ok());
}

#[test]
fn reject_malformed_numeric_bool() {
    let res: Result<Post, _> = serde_json::from_str(
        r#"{"no": 1, "resto": 0, "time": 1571420000, "sticky": 2}"#,
    );
    assert!(res.is_err());
}

#[test]
fn reject_unknown_extension() {
    let mut post = op_with_image();
    post.image.as_mut().unwrap().ext = ".exe".to_string();
    match post.validate() {
        Err(ValidationError::BadExtension { no: 100, .. }) => {}
        other => panic!("unexpected verdict: {:?}", other),
    }
}

#[test]
fn reject_malformed_md5() {
    let mut post = op_with_image();
    post.image.as_mut().unwrap().md5 = "tooshort".to_string();
    assert!(post.validate().is_err());

    let mut post = op_with_image();
    post.image.as_mut().unwrap().md5 = "rl2m2jcoQVkkBVZUqpJT!A==".to_string();
    assert!(post.validate().is_err());
}

#[test]
fn reject_unknown_capcode() {
    let mut post = reply(105);
    post.capcode = Some("janitor".to_string());
    assert!(post.validate().is_err());

    let mut post = reply(105);
    post.capcode = Some("mod".to_string());
    assert!(post.validate().is_ok());
}

#[test]
fn reject_zero_timestamp() {
    let mut post = reply(105);
    post.time = 0;
    match post.validate() {
        Err(ValidationError::ZeroField { field: "time", .. }) => {}
        other => panic!("unexpected verdict: {:?}", other),
    }
}

#[test]
fn reject_oversized_subject() {
    let mut post = op_with_image();
    post.subject = Some("x".repeat(2048));
    assert!(post.validate().is_err());
}

#[test]
fn board_names() {
    assert!(Board::new("g").is_ok());
    assert!(Board::new("vg").is_ok());
    assert!(Board::new("3").is_ok());
    assert!(Board::new("").is_err());
    assert!(Board::new("G").is_err());
    assert!(Board::new("a/b").is_err());
    assert!(Board::new("boardnamethatgoeson").is_err());
}

#[test]
fn plain_text_strips_markup() {
    let post = op_with_image();
    let (subject, comment) = post.plain_text();
    assert_eq!(subject, "catalog & thread");
    assert_eq!(comment, "first \n post");
}
