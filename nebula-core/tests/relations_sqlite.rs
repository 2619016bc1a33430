use nebula_core::prelude::*;
use nebula_core::test_utils::MockDatabase;

struct Post;
struct Comment;
struct Tag;
struct Author;
struct Profile;
struct Video;
struct Like;

impl Model for Post {
    fn table_name() -> &'static str {
        "posts"
    }

    fn relations(registry: &mut RelationRegistry) {
        registry.has_many::<Comment>("comments", "post_id");
        registry
            .belongs_to_many::<Tag>("tags", "post_tag", "post_id", "tag_id")
            .with_pivot(&["position"]);
        registry.belongs_to::<Author>("author", "author_id");
    }
}

impl Model for Comment {
    fn table_name() -> &'static str {
        "comments"
    }

    fn relations(registry: &mut RelationRegistry) {
        registry.belongs_to::<Author>("author", "author_id");
        registry.belongs_to::<Post>("post", "post_id");
    }
}

impl Model for Tag {
    fn table_name() -> &'static str {
        "tags"
    }

    fn timestamps() -> bool {
        false
    }
}

impl Model for Author {
    fn table_name() -> &'static str {
        "authors"
    }

    fn hidden() -> &'static [&'static str] {
        &["email"]
    }

    fn relations(registry: &mut RelationRegistry) {
        registry.has_one::<Profile>("profile", "author_id");
    }
}

impl Model for Profile {
    fn table_name() -> &'static str {
        "profiles"
    }
}

impl Model for Video {
    fn table_name() -> &'static str {
        "videos"
    }
}

impl Model for Like {
    fn table_name() -> &'static str {
        "likes"
    }

    fn relations(registry: &mut RelationRegistry) {
        registry
            .morph_to("likeable")
            .target::<Post>()
            .target::<Video>();
    }
}

const SCHEMA: &str = "
CREATE TABLE authors (id INTEGER PRIMARY KEY, name TEXT, email TEXT, created_at TEXT, updated_at TEXT);
CREATE TABLE profiles (id INTEGER PRIMARY KEY, author_id INTEGER, bio TEXT, created_at TEXT, updated_at TEXT);
CREATE TABLE posts (id INTEGER PRIMARY KEY, author_id INTEGER, title TEXT, created_at TEXT, updated_at TEXT);
CREATE TABLE comments (id INTEGER PRIMARY KEY, post_id INTEGER, author_id INTEGER, body TEXT, created_at TEXT, updated_at TEXT);
CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT);
CREATE TABLE post_tag (post_id INTEGER, tag_id INTEGER, position INTEGER);
CREATE TABLE videos (id INTEGER PRIMARY KEY, url TEXT, created_at TEXT, updated_at TEXT);
CREATE TABLE likes (id INTEGER PRIMARY KEY, likeable_class TEXT, likeable_id INTEGER, created_at TEXT, updated_at TEXT);

INSERT INTO authors (id, name, email) VALUES (1, 'ann', 'ann@example.com'), (2, 'ben', 'ben@example.com');
INSERT INTO profiles (author_id, bio) VALUES (1, 'writes a lot');
INSERT INTO posts (id, author_id, title) VALUES (1, 1, 'first'), (2, 1, 'second'), (3, 2, 'third'), (4, NULL, 'draft');
INSERT INTO comments (post_id, author_id, body) VALUES
    (1, 2, 'nice'), (1, 1, 'thanks'), (2, 2, 'hm'), (3, 1, 'ok');
INSERT INTO tags (id, label) VALUES (4, 'rust'), (5, 'sql'), (6, 'orm');
INSERT INTO post_tag (post_id, tag_id, position) VALUES (1, 6, 1), (2, 4, 1);
INSERT INTO videos (id, url) VALUES (1, 'v.mp4');
INSERT INTO likes (likeable_class, likeable_id) VALUES ('Post', 1), ('Video', 1), ('Post', 3), ('Post', 1);
";

async fn setup() -> Executor {
    MockDatabase::new_sqlite()
        .await
        .unwrap()
        .with_schema(SCHEMA)
        .await
        .unwrap()
        .into_executor()
}

fn ids(entities: &Collection<Entity>) -> Vec<Value> {
    entities.pluck("id").into_vec()
}

#[tokio::test]
async fn has_many_eager_load_is_one_query() {
    let db = setup().await;
    db.enable_query_log();

    let posts = Post::with(&db, "comments")
        .where_in("id", [1, 2, 3])
        .get()
        .await
        .unwrap();

    let log = db.query_log();
    assert_eq!(log.len(), 2);
    assert_eq!(
        log[1].sql,
        "SELECT * FROM main.comments WHERE post_id IN (?,?,?)"
    );
    assert_eq!(
        log[1].params,
        vec![Value::I64(1), Value::I64(2), Value::I64(3)]
    );

    let counts: Vec<usize> = posts
        .iter()
        .map(|post| post.relation("comments").unwrap().as_many().unwrap().count())
        .collect();
    assert_eq!(counts, vec![2, 1, 1]);
}

#[tokio::test]
async fn query_count_is_independent_of_parent_count() {
    let db = setup().await;
    db.enable_query_log();
    let posts = Post::with(&db, "comments").get().await.unwrap();
    assert_eq!(posts.count(), 4);
    assert_eq!(db.query_log().len(), 2);

    let draft = posts.where_eq("title", "draft");
    assert!(draft[0].relation("comments").unwrap().as_many().unwrap().is_empty());
}

#[tokio::test]
async fn belongs_to_and_has_one() {
    let db = setup().await;
    let comments = Comment::with(&db, "author.profile").get().await.unwrap();
    let first = &comments[0];
    let author = first.relation("author").unwrap().as_one().unwrap();
    assert_eq!(author.get("name"), Some(&Value::from("ben")));
    assert!(author.relation("profile").unwrap().as_one().is_none());

    let second_author = comments[1].relation("author").unwrap().as_one().unwrap();
    let profile = second_author.relation("profile").unwrap().as_one().unwrap();
    assert_eq!(profile.get("bio"), Some(&Value::from("writes a lot")));

    let posts = Post::with(&db, "author").get().await.unwrap();
    let draft = posts.where_eq("title", "draft");
    assert_eq!(draft[0].relation("author"), Some(&Related::One(None)));
}

#[tokio::test]
async fn nested_paths_batch_every_level() {
    let db = setup().await;
    db.enable_query_log();
    let posts = Post::with(&db, "comments.author")
        .with("tags")
        .get()
        .await
        .unwrap();
    // posts, comments, authors, tags
    assert_eq!(db.query_log().len(), 4);

    let first = &posts[0];
    let comments = first.relation("comments").unwrap().as_many().unwrap();
    let authors: Vec<&Value> = comments
        .iter()
        .filter_map(|c| c.relation("author")?.as_one()?.get("name"))
        .collect();
    assert_eq!(authors, vec![&Value::from("ben"), &Value::from("ann")]);

    let json = first.clean();
    assert!(json["comments"][0]["author"].get("email").is_none());
    assert_eq!(json["tags"][0]["label"], serde_json::json!("orm"));
    assert!(json["tags"][0].get("pivot").is_none());
}

#[tokio::test]
async fn comma_lists_load_siblings() {
    let db = setup().await;
    let posts = Post::with(&db, "tags,comments").get().await.unwrap();
    assert!(posts.iter().all(|p| p.relation("tags").is_some() && p.relation("comments").is_some()));
}

#[tokio::test]
async fn belongs_to_many_unpacks_pivot() {
    let db = setup().await;
    let post = Post::with(&db, "tags").find(1).await.unwrap().unwrap();
    let tags = post.relation("tags").unwrap().as_many().unwrap();
    assert_eq!(tags.count(), 1);
    let tag = &tags[0];
    assert_eq!(tag.get("label"), Some(&Value::from("orm")));
    assert!(tag.get("pivot.post_id").is_none());
    let pivot = tag.pivot().unwrap();
    assert_eq!(pivot["post_id"], Value::I64(1));
    assert_eq!(pivot["tag_id"], Value::I64(6));
    assert_eq!(pivot["position"], Value::I64(1));
}

#[tokio::test]
async fn sync_replaces_pivot_rows() {
    let db = setup().await;
    let mut post = Post::find_or_fail(&db, 1).await.unwrap();
    db.enable_query_log();

    post.sync(&db, "tags", [4, 5]).await.unwrap();

    let log = db.query_log();
    assert_eq!(log[0].sql, "DELETE FROM main.post_tag WHERE post_id = ?");
    assert_eq!(log[0].params, vec![Value::I64(1)]);
    let inserts: Vec<_> = log.iter().filter(|q| q.sql.starts_with("INSERT")).collect();
    assert_eq!(inserts.len(), 2);
    assert_eq!(
        inserts[0].sql,
        "INSERT INTO main.post_tag (post_id, tag_id) VALUES (?,?)"
    );
    assert_eq!(inserts[0].params, vec![Value::I64(1), Value::I64(4)]);
    assert_eq!(inserts[1].params, vec![Value::I64(1), Value::I64(5)]);

    let tags = post.relation("tags").unwrap().as_many().unwrap();
    assert_eq!(ids(tags), vec![Value::I64(4), Value::I64(5)]);

    post.sync(&db, "tags", Vec::<i64>::new()).await.unwrap();
    assert!(post.relation("tags").unwrap().as_many().unwrap().is_empty());
    assert_eq!(
        db.table("post_tag").where_eq("post_id", 1).count().await.unwrap(),
        0
    );
    assert_eq!(db.table("post_tag").count().await.unwrap(), 1);
}

#[tokio::test]
async fn attach_and_detach() {
    let db = setup().await;
    let mut post = Post::find_or_fail(&db, 2).await.unwrap();

    post.attach(&db, "tags", 5, record! { "position" => 2 })
        .await
        .unwrap();
    let tags = post.relation("tags").unwrap().as_many().unwrap();
    assert_eq!(tags.count(), 2);
    let sql_tag = tags.where_eq("id", 5);
    assert_eq!(sql_tag[0].pivot().unwrap()["position"], Value::I64(2));

    post.detach(&db, "tags", 4).await.unwrap();
    let tags = post.relation("tags").unwrap().as_many().unwrap();
    assert_eq!(ids(tags), vec![Value::I64(5)]);

    let err = post.attach(&db, "comments", 1, record! {}).await.unwrap_err();
    assert!(matches!(err, NebulaError::RelationshipConfig { .. }));

    let mut unsaved = Post::make(record! { "title" => "new" });
    let err = unsaved.sync(&db, "tags", [4]).await.unwrap_err();
    assert!(matches!(err, NebulaError::QueryArgument(_)));
}

#[tokio::test]
async fn morph_to_queries_once_per_class() {
    let db = setup().await;
    db.enable_query_log();
    let likes = Like::with(&db, "likeable").get().await.unwrap();

    let log = db.query_log();
    assert_eq!(log.len(), 3);
    assert_eq!(log[1].sql, "SELECT * FROM main.posts WHERE id IN (?,?)");
    assert_eq!(log[1].params, vec![Value::I64(1), Value::I64(3)]);
    assert_eq!(log[2].sql, "SELECT * FROM main.videos WHERE id IN (?)");

    let targets: Vec<Option<&str>> = likes
        .iter()
        .map(|like| {
            like.relation("likeable")
                .and_then(Related::as_one)
                .map(|target| target.entity_type().class_name())
        })
        .collect();
    assert_eq!(
        targets,
        vec![Some("Post"), Some("Video"), Some("Post"), Some("Post")]
    );

    let lazy = likes[1].related(&db, "likeable").unwrap().first().await.unwrap();
    assert_eq!(lazy.unwrap().get("url"), Some(&Value::from("v.mp4")));
}

#[tokio::test]
async fn lazy_relations_return_filtered_queries() {
    let db = setup().await;
    let post = Post::find_or_fail(&db, 1).await.unwrap();

    let query = post.related(&db, "comments").unwrap();
    assert_eq!(query.to_sql(), "SELECT * FROM main.comments WHERE post_id = ?");
    let mine = post
        .related(&db, "comments")
        .unwrap()
        .where_eq("author_id", 1)
        .get()
        .await
        .unwrap();
    assert_eq!(mine.count(), 1);

    let draft = Post::find_or_fail(&db, 4).await.unwrap();
    let author = draft.related(&db, "author").unwrap();
    assert_eq!(author.to_sql(), "SELECT * FROM main.authors WHERE 1=0");
    assert!(author.first().await.unwrap().is_none());

    let err = post.related(&db, "reviews").unwrap_err();
    assert!(matches!(
        err,
        NebulaError::RelationshipConfig { ref relation, .. } if relation == "reviews"
    ));
}

#[tokio::test]
async fn load_caches_until_refresh() {
    let db = setup().await;
    let mut post = Post::find_or_fail(&db, 1).await.unwrap();
    db.enable_query_log();

    let count = post.load(&db, "comments").await.unwrap().as_many().unwrap().count();
    assert_eq!(count, 2);
    post.load(&db, "comments").await.unwrap();
    assert_eq!(db.query_log().len(), 1);

    db.execute_script("INSERT INTO comments (post_id, body) VALUES (1, 'late')")
        .await
        .unwrap();
    let refreshed = post.refresh_relation(&db, "comments").await.unwrap();
    assert_eq!(refreshed.as_many().unwrap().count(), 3);
}

#[tokio::test]
async fn collection_load_and_unknown_relations() {
    let db = setup().await;
    let mut posts = Post::query(&db).where_in("id", [1, 2]).get().await.unwrap();
    posts.load(&db, "author").await.unwrap();
    assert!(posts.iter().all(|post| post.relation("author").is_some()));

    let err = Post::with(&db, "reviews").get().await.unwrap_err();
    assert!(matches!(err, NebulaError::RelationshipConfig { .. }));

    let grouped = posts.group_by("author_id");
    assert_eq!(grouped.count(), 1);
    assert_eq!(posts.where_class("Post").count(), 2);
    assert_eq!(posts.where_class("Video").count(), 0);
}

#[tokio::test]
async fn nested_paths_reach_cached_relations() {
    let db = setup().await;
    let mut post = Post::find_or_fail(&db, 1).await.unwrap();
    post.load(&db, "comments").await.unwrap();
    db.enable_query_log();

    let comments = post.load(&db, "comments.author").await.unwrap().as_many().unwrap();
    assert_eq!(comments.count(), 2);
    assert!(comments.iter().all(|c| c.relation("author").is_some()));
    let log = db.query_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].sql, "SELECT * FROM main.authors WHERE id IN (?,?)");

    post.load(&db, "comments.author").await.unwrap();
    assert_eq!(db.query_log().len(), 1);
}

#[tokio::test]
async fn collection_nested_paths_reach_cached_relations() {
    let db = setup().await;
    let mut posts = Post::query(&db).where_in("id", [1, 2, 3]).get().await.unwrap();
    posts.load(&db, "comments").await.unwrap();
    db.enable_query_log();

    posts.load(&db, "comments.author").await.unwrap();
    assert_eq!(db.query_log().len(), 1);
    let counts: Vec<usize> = posts
        .iter()
        .map(|post| post.relation("comments").unwrap().as_many().unwrap().count())
        .collect();
    assert_eq!(counts, vec![2, 1, 1]);
    for post in posts.iter() {
        let comments = post.relation("comments").unwrap().as_many().unwrap();
        assert!(comments.iter().all(|c| c.relation("author").unwrap().as_one().is_some()));
    }
}

#[tokio::test]
async fn find_through_pivot_with_its_own_id() {
    let db = setup().await;
    db.execute_script("ALTER TABLE post_tag ADD COLUMN id INTEGER")
        .await
        .unwrap();
    let post = Post::find_or_fail(&db, 1).await.unwrap();

    let tag = post
        .related(&db, "tags")
        .unwrap()
        .find(6)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tag.get("label"), Some(&Value::from("orm")));

    let missing = post.related(&db, "tags").unwrap().find(4).await.unwrap();
    assert!(missing.is_none());
}
