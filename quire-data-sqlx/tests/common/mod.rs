#![allow(dead_code)]

use std::sync::{Arc, LazyLock};

use quire_data::{
    FieldDescriptor, FieldKind, Format, Manifest, ManifestError, RelationDefinition,
    RelationTarget, Value,
};
use quire_data_sqlx::{Dal, DalConfig, Migration, Migrator};
use uuid::Uuid;

pub const SCHEMA: &str = r#"
CREATE TABLE things (
    rev_id TEXT PRIMARY KEY NOT NULL,
    id TEXT NOT NULL,
    rev_user TEXT NOT NULL,
    rev_date TEXT NOT NULL,
    rev_tags TEXT,
    rev_deleted INTEGER NOT NULL DEFAULT 0,
    old_rev_of TEXT,
    label TEXT NOT NULL,
    score INTEGER,
    ratio REAL,
    tags TEXT,
    meta TEXT
);
CREATE UNIQUE INDEX things_current ON things (id) WHERE old_rev_of IS NULL AND rev_deleted = 0;

CREATE TABLE notes (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    body TEXT,
    views INTEGER,
    author_email TEXT,
    secret TEXT,
    created_on TEXT
);

CREATE TABLE authors (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL
);

CREATE TABLE books (
    rev_id TEXT PRIMARY KEY NOT NULL,
    id TEXT NOT NULL,
    rev_user TEXT NOT NULL,
    rev_date TEXT NOT NULL,
    rev_tags TEXT,
    rev_deleted INTEGER NOT NULL DEFAULT 0,
    old_rev_of TEXT,
    title TEXT NOT NULL,
    author_id TEXT
);
CREATE UNIQUE INDEX books_current ON books (id) WHERE old_rev_of IS NULL AND rev_deleted = 0;

CREATE TABLE vaults (
    rev_id TEXT PRIMARY KEY NOT NULL,
    id TEXT NOT NULL,
    rev_user TEXT NOT NULL,
    rev_date TEXT NOT NULL,
    rev_tags TEXT,
    rev_deleted INTEGER NOT NULL DEFAULT 0,
    old_rev_of TEXT,
    label TEXT NOT NULL,
    secret TEXT NOT NULL
);

CREATE TABLE book_authors (
    book_id TEXT NOT NULL,
    author_id TEXT NOT NULL REFERENCES authors (id),
    PRIMARY KEY (book_id, author_id)
);
"#;

static THINGS: LazyLock<Result<Arc<Manifest>, ManifestError>> = LazyLock::new(|| {
    Manifest::builder("things")
        .revisioned()
        .field("label", FieldDescriptor::string().required().max(40))
        .field("score", FieldDescriptor::integer().min(0))
        .field("ratio", FieldDescriptor::number())
        .field("tags", FieldDescriptor::array(FieldKind::String).default_value(Vec::<String>::new()))
        .field("meta", FieldDescriptor::object())
        .virtual_field("shout", FieldKind::String, |r| {
            r.get("label")
                .and_then(Value::as_str)
                .map(|s| Value::Text(s.to_uppercase()))
                .unwrap_or_default()
        })
        .method("labelLength", |r| {
            Value::Int(r.get("label").and_then(Value::as_str).map_or(0, |s| s.len() as i64))
        })
        .build()
});

pub fn things() -> Result<Arc<Manifest>, ManifestError> {
    THINGS.clone()
}

static NOTES: LazyLock<Result<Arc<Manifest>, ManifestError>> = LazyLock::new(|| {
    Manifest::builder("notes")
        .field("title", FieldDescriptor::string().required())
        .field("body", FieldDescriptor::string())
        .field("views", FieldDescriptor::integer().default_value(0))
        .field("authorEmail", FieldDescriptor::string().format(Format::Email))
        .field("secret", FieldDescriptor::string().sensitive())
        .field("createdOn", FieldDescriptor::date())
        .build()
});

pub fn notes() -> Result<Arc<Manifest>, ManifestError> {
    NOTES.clone()
}

static AUTHORS: LazyLock<Result<Arc<Manifest>, ManifestError>> = LazyLock::new(|| {
    Manifest::builder("authors")
        .field("name", FieldDescriptor::string().required())
        .relation(RelationDefinition::many(
            "books",
            RelationTarget::lazy(books),
            "id",
            "authorId",
        ))
        .build()
});

pub fn authors() -> Result<Arc<Manifest>, ManifestError> {
    AUTHORS.clone()
}

static BOOKS: LazyLock<Result<Arc<Manifest>, ManifestError>> = LazyLock::new(|| {
    Manifest::builder("books")
        .revisioned()
        .field("title", FieldDescriptor::string().required())
        .field("authorId", FieldDescriptor::uuid())
        .relation(RelationDefinition::one(
            "author",
            RelationTarget::lazy(authors),
            "authorId",
            "id",
        ))
        .relation(
            RelationDefinition::many("coauthors", RelationTarget::lazy(authors), "id", "id")
                .through("book_authors", "book_id", "author_id"),
        )
        .build()
});

pub fn books() -> Result<Arc<Manifest>, ManifestError> {
    BOOKS.clone()
}

static VAULTS: LazyLock<Result<Arc<Manifest>, ManifestError>> = LazyLock::new(|| {
    Manifest::builder("vaults")
        .revisioned()
        .field("label", FieldDescriptor::string().required())
        .field("secret", FieldDescriptor::string().required().sensitive())
        .build()
});

pub fn vaults() -> Result<Arc<Manifest>, ManifestError> {
    VAULTS.clone()
}

pub fn migrator() -> Migrator {
    Migrator::new(vec![Migration::new("001_fixtures.sql", SCHEMA)])
}

/// A fresh in-memory DAL with the fixture schema applied.
pub async fn connect() -> Dal {
    connect_with(DalConfig::in_memory()).await
}

pub async fn connect_with(config: DalConfig) -> Dal {
    let dal = Dal::connect(config).await.unwrap();
    dal.migrate(&migrator()).await.unwrap();
    dal
}

pub fn user() -> Uuid {
    Uuid::new_v4()
}
