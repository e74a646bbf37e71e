//! The `.apkg` container.
//!
//! A package is a zip archive holding `collection.anki2` (an SQLite database
//! in the legacy schema 11 layout), every media file under a numeric entry
//! name, and a `media` JSON object mapping those numbers to file names.

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::path::Path;

use regex::Regex;
use rusqlite::{params, Connection, OpenFlags};
use serde::Deserialize;
use serde_json::json;
use sha1::{Digest, Sha1};
use zip::write::SimpleFileOptions;
use zip::CompressionMethod;

use super::template::{self, strip_html, CSS, FIELD_NAMES, MODEL_NAME, TEMPLATES};
use super::AssembledDeck;
use crate::cache::tmp_path;
use crate::error::AssemblyError;

const SCHEMA: &str = r#"
CREATE TABLE col (
    id integer primary key, crt integer not null, mod integer not null,
    scm integer not null, ver integer not null, dty integer not null,
    usn integer not null, ls integer not null, conf text not null,
    models text not null, decks text not null, dconf text not null,
    tags text not null
);
CREATE TABLE notes (
    id integer primary key, guid text not null, mid integer not null,
    mod integer not null, usn integer not null, tags text not null,
    flds text not null, sfld integer not null, csum integer not null,
    flags integer not null, data text not null
);
CREATE TABLE cards (
    id integer primary key, nid integer not null, did integer not null,
    ord integer not null, mod integer not null, usn integer not null,
    type integer not null, queue integer not null, due integer not null,
    ivl integer not null, factor integer not null, reps integer not null,
    lapses integer not null, left integer not null, odue integer not null,
    odid integer not null, flags integer not null, data text not null
);
CREATE TABLE revlog (
    id integer primary key, cid integer not null, usn integer not null,
    ease integer not null, ivl integer not null, lastIvl integer not null,
    factor integer not null, time integer not null, type integer not null
);
CREATE TABLE graves (usn integer not null, oid integer not null, type integer not null);
CREATE INDEX ix_notes_usn ON notes (usn);
CREATE INDEX ix_cards_usn ON cards (usn);
CREATE INDEX ix_revlog_usn ON revlog (usn);
CREATE INDEX ix_cards_nid ON cards (nid);
CREATE INDEX ix_cards_sched ON cards (did, queue, due);
CREATE INDEX ix_revlog_cid ON revlog (cid);
CREATE INDEX ix_notes_csum ON notes (csum);
"#;

const FIELD_SEPARATOR: char = '\x1f';

/// Write `deck` to `dest`. The package appears in one rename, so a failed
/// write never leaves a partial file at `dest`.
pub fn write_package(deck: &AssembledDeck, dest: &Path) -> Result<(), AssemblyError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_path = tmp_path(&dest.with_extension("anki2"));
    let collection = write_collection(deck, &db_path).and_then(|()| Ok(std::fs::read(&db_path)?));
    let _ = std::fs::remove_file(&db_path);
    let collection = collection?;

    let staged = tmp_path(dest);
    if let Err(e) = write_archive(deck, &collection, &staged) {
        let _ = std::fs::remove_file(&staged);
        return Err(e);
    }
    std::fs::rename(&staged, dest)?;
    log::info!("Wrote {} ({} notes)", dest.display(), deck.notes.len());
    Ok(())
}

fn write_archive(deck: &AssembledDeck, collection: &[u8], path: &Path) -> Result<(), AssemblyError> {
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path)?);
    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file("collection.anki2", deflated)?;
    zip.write_all(collection)?;

    let mut media_map = serde_json::Map::new();
    for (i, media) in deck.media.iter().enumerate() {
        let bytes = std::fs::read(&media.path)?;
        zip.start_file(i.to_string(), stored)?;
        zip.write_all(&bytes)?;
        media_map.insert(i.to_string(), json!(media.name));
    }

    zip.start_file("media", deflated)?;
    zip.write_all(serde_json::to_string(&media_map)?.as_bytes())?;
    zip.finish()?;
    Ok(())
}

fn write_collection(deck: &AssembledDeck, path: &Path) -> Result<(), AssemblyError> {
    let mut conn = Connection::open(path)?;
    conn.execute_batch(SCHEMA)?;

    let now_ms = deck.created_ms;
    let now = now_ms / 1000;
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO col VALUES (1, ?1, ?2, ?2, 11, 0, 0, 0, ?3, ?4, ?5, ?6, '{}')",
        params![
            now,
            now_ms,
            collection_conf(deck).to_string(),
            models_json(deck, now).to_string(),
            decks_json(deck, now).to_string(),
            dconf_json().to_string(),
        ],
    )?;

    {
        let mut insert_note = tx.prepare(
            "INSERT INTO notes VALUES (?1, ?2, ?3, ?4, -1, ?5, ?6, ?7, ?8, 0, '')",
        )?;
        let mut insert_card = tx.prepare(
            "INSERT INTO cards VALUES (?1, ?2, ?3, ?4, ?5, -1, 0, 0, ?6, 0, 0, 0, 0, 0, 0, 0, 0, '')",
        )?;

        for (i, note) in deck.notes.iter().enumerate() {
            let note_id = now_ms + i as i64;
            let sort_field = note.fields.first().map(String::as_str).unwrap_or_default();
            insert_note.execute(params![
                note_id,
                note.guid,
                deck.model_id,
                now,
                format!(" {} ", note.tags.join(" ")),
                note.fields.join(&FIELD_SEPARATOR.to_string()),
                sort_field,
                field_checksum(sort_field),
            ])?;

            for ord in 0..TEMPLATES.len() {
                let card_id = now_ms + (i * TEMPLATES.len() + ord) as i64;
                insert_card.execute(params![
                    card_id,
                    note_id,
                    deck.deck_id,
                    ord as i64,
                    now,
                    i as i64 + 1,
                ])?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

/// First 32 bits of the SHA-1 of the field's text content, as Anki computes
/// its duplicate-check checksum.
pub fn field_checksum(field: &str) -> i64 {
    let digest = Sha1::digest(strip_html(field).as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as i64
}

fn collection_conf(deck: &AssembledDeck) -> serde_json::Value {
    json!({
        "activeDecks": [1],
        "curDeck": deck.deck_id,
        "newSpread": 0,
        "collapseTime": 1200,
        "timeLim": 0,
        "estTimes": true,
        "dueCounts": true,
        "curModel": deck.model_id.to_string(),
        "nextPos": deck.notes.len() + 1,
        "sortType": "noteFld",
        "sortBackwards": false,
        "addToCur": true,
    })
}

fn models_json(deck: &AssembledDeck, now: i64) -> serde_json::Value {
    let fields: Vec<_> = FIELD_NAMES
        .iter()
        .enumerate()
        .map(|(ord, name)| {
            json!({
                "name": name, "ord": ord, "sticky": false, "rtl": false,
                "font": "Arial", "size": 20, "media": [],
            })
        })
        .collect();
    let templates: Vec<_> = TEMPLATES
        .iter()
        .enumerate()
        .map(|(ord, t)| {
            json!({
                "name": t.name, "ord": ord, "qfmt": t.front, "afmt": t.back,
                "did": null, "bqfmt": "", "bafmt": "",
            })
        })
        .collect();
    let field_index = |name: &str| FIELD_NAMES.iter().position(|f| *f == name);
    // Fields whose presence makes each card non-empty.
    let required = [
        vec![field_index("Hanzi")],
        vec![field_index("AudioMarkup")],
        vec![field_index("Indo"), field_index("Grammar")],
    ];
    let req: Vec<_> = required
        .iter()
        .enumerate()
        .map(|(ord, fields)| json!([ord, "any", fields.iter().flatten().collect::<Vec<_>>()]))
        .collect();

    let mut models = serde_json::Map::new();
    models.insert(
        deck.model_id.to_string(),
        json!({
            "id": deck.model_id,
            "name": MODEL_NAME,
            "type": 0,
            "mod": now,
            "usn": -1,
            "sortf": 0,
            "did": deck.deck_id,
            "tmpls": templates,
            "flds": fields,
            "css": CSS,
            "latexPre": "\\documentclass[12pt]{article}\n\\special{papersize=3in,5in}\n\\usepackage{amssymb,amsmath}\n\\pagestyle{empty}\n\\setlength{\\parindent}{0in}\n\\begin{document}\n",
            "latexPost": "\\end{document}",
            "latexsvg": false,
            "req": req,
            "tags": [],
            "vers": [],
        }),
    );
    serde_json::Value::Object(models)
}

fn deck_json(id: i64, name: &str, now: i64) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "desc": "",
        "mod": now,
        "usn": -1,
        "collapsed": false,
        "browserCollapsed": false,
        "newToday": [0, 0],
        "revToday": [0, 0],
        "lrnToday": [0, 0],
        "timeToday": [0, 0],
        "dyn": 0,
        "conf": 1,
        "extendNew": 10,
        "extendRev": 50,
    })
}

fn decks_json(deck: &AssembledDeck, now: i64) -> serde_json::Value {
    let mut decks = serde_json::Map::new();
    decks.insert("1".to_string(), deck_json(1, "Default", now));
    decks.insert(deck.deck_id.to_string(), deck_json(deck.deck_id, &deck.title, now));
    serde_json::Value::Object(decks)
}

fn dconf_json() -> serde_json::Value {
    json!({
        "1": {
            "id": 1,
            "name": "Default",
            "mod": 0,
            "usn": 0,
            "dyn": false,
            "autoplay": true,
            "replayq": true,
            "timer": 0,
            "maxTaken": 60,
            "new": {
                "perDay": 20, "delays": [1, 10], "ints": [1, 4, 7],
                "initialFactor": 2500, "order": 1, "separate": true, "bury": true,
            },
            "rev": {
                "perDay": 100, "ease4": 1.3, "fuzz": 0.05, "ivlFct": 1,
                "maxIvl": 36500, "minSpace": 1, "bury": true,
            },
            "lapse": {
                "delays": [10], "mult": 0, "minInt": 1, "leechFails": 8, "leechAction": 0,
            },
        }
    })
}

/// A note type as stored in a package.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageModel {
    pub id: i64,
    pub name: String,
    pub fields: Vec<String>,
    pub templates: Vec<(String, String, String)>,
    pub css: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackageNote {
    pub id: i64,
    pub guid: String,
    pub model_id: i64,
    pub fields: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageCard {
    pub id: i64,
    pub note_id: i64,
    pub deck_id: i64,
    pub ord: usize,
    pub due: i64,
}

/// One card rendered for preview.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedCard {
    pub card_id: i64,
    pub note_id: i64,
    pub deck_name: String,
    pub template_name: String,
    pub front: String,
    pub back: String,
    pub css: String,
}

/// The contents of a package, read back for inspection.
#[derive(Debug, Clone, Default)]
pub struct PackageContents {
    pub decks: HashMap<i64, String>,
    pub models: Vec<PackageModel>,
    pub notes: Vec<PackageNote>,
    /// Cards ordered by deck, then id.
    pub cards: Vec<PackageCard>,
    /// Media file name to contents.
    pub media: HashMap<String, Vec<u8>>,
}

impl PackageContents {
    /// `[sound:...]` targets that no media file in the package satisfies.
    pub fn dangling_media(&self) -> Vec<String> {
        let Ok(sound) = Regex::new(r"\[sound:([^\]]+)\]") else {
            return Vec::new();
        };
        let referenced: BTreeSet<&str> = self
            .notes
            .iter()
            .flat_map(|n| n.fields.iter())
            .flat_map(|f| sound.captures_iter(f).filter_map(|c| c.get(1)).map(|m| m.as_str()))
            .collect();
        referenced
            .into_iter()
            .filter(|name| self.media.get(*name).map_or(true, |bytes| bytes.is_empty()))
            .map(str::to_string)
            .collect()
    }

    /// Front and back of every card, rendered from its note type.
    pub fn render_cards(&self) -> Vec<RenderedCard> {
        let notes: HashMap<i64, &PackageNote> = self.notes.iter().map(|n| (n.id, n)).collect();
        let models: HashMap<i64, &PackageModel> = self.models.iter().map(|m| (m.id, m)).collect();

        self.cards
            .iter()
            .filter_map(|card| {
                let note = notes.get(&card.note_id)?;
                let model = models.get(&note.model_id)?;
                let (name, qfmt, afmt) = model.templates.get(card.ord)?;
                let fields: HashMap<&str, &str> = model
                    .fields
                    .iter()
                    .map(String::as_str)
                    .zip(note.fields.iter().map(String::as_str).chain(std::iter::repeat("")))
                    .collect();
                let front = template::render(qfmt, &fields, None);
                let back = template::render(afmt, &fields, Some(&front));
                Some(RenderedCard {
                    card_id: card.id,
                    note_id: note.id,
                    deck_name: self
                        .decks
                        .get(&card.deck_id)
                        .cloned()
                        .unwrap_or_else(|| format!("Deck {}", card.deck_id)),
                    template_name: name.clone(),
                    front,
                    back,
                    css: model.css.clone(),
                })
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct ModelJson {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    flds: Vec<NamedJson>,
    #[serde(default)]
    tmpls: Vec<TemplateJson>,
    #[serde(default)]
    css: String,
}

#[derive(Deserialize)]
struct NamedJson {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct TemplateJson {
    #[serde(default)]
    name: String,
    #[serde(default)]
    qfmt: String,
    #[serde(default)]
    afmt: String,
}

/// Read a package written by [`write_package`] (or by Anki).
pub fn read_package(path: &Path) -> Result<PackageContents, AssemblyError> {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?)?;

    let media_map: HashMap<String, String> = match archive.by_name("media") {
        Ok(mut entry) => {
            let mut text = String::new();
            entry.read_to_string(&mut text)?;
            serde_json::from_str(&text)?
        }
        Err(zip::result::ZipError::FileNotFound) => HashMap::new(),
        Err(e) => return Err(e.into()),
    };

    let mut media = HashMap::new();
    for (key, name) in media_map {
        let mut bytes = Vec::new();
        match archive.by_name(&key) {
            Ok(mut entry) => {
                entry.read_to_end(&mut bytes)?;
                media.insert(name, bytes);
            }
            Err(zip::result::ZipError::FileNotFound) => {
                log::warn!("Package lists media '{name}' but has no entry '{key}'");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let collection_name = ["collection.anki21", "collection.anki2"]
        .into_iter()
        .find(|name| archive.file_names().any(|n| n == *name))
        .ok_or_else(|| AssemblyError::Invalid("no collection database in package".to_string()))?;
    let mut collection = Vec::new();
    archive.by_name(collection_name)?.read_to_end(&mut collection)?;

    // Staged outside the package's directory, which may be read-only.
    let db_path = tmp_path(&std::env::temp_dir().join("vocab-deck-read.anki2"));
    std::fs::write(&db_path, &collection)?;
    let contents = read_collection(&db_path);
    let _ = std::fs::remove_file(&db_path);

    let mut contents = contents?;
    contents.media = media;
    Ok(contents)
}

fn read_collection(path: &Path) -> Result<PackageContents, AssemblyError> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let (models, decks): (String, String) =
        conn.query_row("SELECT models, decks FROM col", [], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let models: HashMap<String, ModelJson> = serde_json::from_str(&models)?;
    let decks: HashMap<String, NamedJson> = serde_json::from_str(&decks)?;

    let mut models: Vec<PackageModel> = models
        .into_values()
        .map(|m| PackageModel {
            id: m.id,
            name: m.name,
            fields: m.flds.into_iter().map(|f| f.name).collect(),
            templates: m.tmpls.into_iter().map(|t| (t.name, t.qfmt, t.afmt)).collect(),
            css: m.css,
        })
        .collect();
    models.sort_by_key(|m| m.id);

    let decks = decks
        .into_iter()
        .filter_map(|(id, deck)| id.parse().ok().map(|id| (id, deck.name)))
        .collect();

    let notes = conn
        .prepare("SELECT id, guid, mid, tags, flds FROM notes ORDER BY id")?
        .query_map([], |row| {
            let tags: String = row.get(3)?;
            let fields: String = row.get(4)?;
            Ok(PackageNote {
                id: row.get(0)?,
                guid: row.get(1)?,
                model_id: row.get(2)?,
                fields: fields.split(FIELD_SEPARATOR).map(str::to_string).collect(),
                tags: tags.split_whitespace().map(str::to_string).collect(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let cards = conn
        .prepare("SELECT id, nid, did, ord, due FROM cards ORDER BY did, id")?
        .query_map([], |row| {
            Ok(PackageCard {
                id: row.get(0)?,
                note_id: row.get(1)?,
                deck_id: row.get(2)?,
                ord: row.get::<_, i64>(3)? as usize,
                due: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PackageContents {
        decks,
        models,
        notes,
        cards,
        media: HashMap::new(),
    })
}
