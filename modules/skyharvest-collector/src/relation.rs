use bsky_client::{permalink, PostView, ProfileView};
use skyharvest_common::{
    Actor, ContentItem, Counts, ExpansionContext, QuotedPost, Relation, Target,
};

/// Reply/quote/repost flags for a post as it appeared in a listing.
///
/// `reposted` is the listing-level repost marker. It outranks an embedded
/// quote; reply flags are filled in regardless.
pub fn relation_of(post: &PostView, reposted: bool) -> Relation {
    let mut relation = Relation::default();

    if reposted {
        relation.is_repost = true;
        relation.original_uri = Some(post.uri.clone());
        relation.original_author = Some(post.author.handle.clone());
    } else if let Some(quote) = post.quote_ref() {
        relation.is_quote = true;
        relation.original_uri = Some(quote.uri);
        relation.original_author = quote.author_handle;
    }

    if let Some(reply) = &post.record.reply {
        relation.is_reply = true;
        relation.parent_uri = Some(reply.parent.uri.clone());
        relation.root_uri = Some(reply.root.uri.clone());
    }

    relation
}

/// Expansion context for a top-level item of `target`.
pub fn classify(target: &Target, relation: &Relation, author_handle: &str) -> ExpansionContext {
    let original = relation.is_original();
    match target {
        Target::Keyword { .. } if original => ExpansionContext::SearchOriginal,
        Target::Keyword { .. } => ExpansionContext::SearchNonoriginal,
        Target::Feed { .. } if original => ExpansionContext::FeedOriginal,
        Target::Feed { .. } => ExpansionContext::FeedNonoriginal,
        Target::Author { handle } if original && handle.eq_ignore_ascii_case(author_handle) => {
            ExpansionContext::OwnOriginal
        }
        Target::Author { .. } => ExpansionContext::AuthorFeedOther,
    }
}

pub fn actor_of(profile: &ProfileView) -> Actor {
    Actor {
        id: profile.did.clone(),
        handle: profile.handle.clone(),
        display_name: profile.display_name.clone().filter(|n| !n.is_empty()),
        labels: profile.labels.iter().map(|l| l.val.clone()).collect(),
    }
}

pub fn quoted_summary(post: &PostView) -> QuotedPost {
    QuotedPost {
        uri: post.uri.clone(),
        author_handle: post.author.handle.clone(),
        author_id: post.author.did.clone(),
        text: post.record.text.clone(),
        created_at: post.record.created_at.clone(),
    }
}

/// A content item with no interaction data yet.
pub fn bare_item(post: &PostView, relation: Relation, context: ExpansionContext) -> ContentItem {
    ContentItem {
        uri: post.uri.clone(),
        cid: post.cid.clone(),
        author_handle: post.author.handle.clone(),
        author_id: post.author.did.clone(),
        author_display_name: post.author.display_name.clone(),
        text: post.record.text.clone(),
        url: post_permalink(&post.uri, &post.author.handle),
        created_at: post
            .record
            .created_at
            .clone()
            .or_else(|| post.indexed_at.clone()),
        indexed_at: post.indexed_at.clone(),
        relation,
        quoted: None,
        counts: Counts::default(),
        children: None,
        source_context: context,
        search_keyword: None,
    }
}

fn post_permalink(uri: &str, handle: &str) -> Option<String> {
    if uri.contains("/app.bsky.feed.post/") {
        permalink(uri, handle)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{post, quote_of, reply_to};

    #[test]
    fn repost_outranks_quote_but_not_reply() {
        let quoted = post("did:plc:q", "q.test", "1");
        let p = reply_to(quote_of(post("did:plc:a", "a.test", "2"), &quoted), "at://root", "at://parent");

        let relation = relation_of(&p, true);
        assert!(relation.is_repost);
        assert!(!relation.is_quote);
        assert!(relation.is_reply);
        assert_eq!(relation.original_uri.as_deref(), Some(p.uri.as_str()));
        assert_eq!(relation.parent_uri.as_deref(), Some("at://parent"));

        let relation = relation_of(&p, false);
        assert!(relation.is_quote);
        assert_eq!(relation.original_uri.as_deref(), Some(quoted.uri.as_str()));
        assert_eq!(relation.original_author.as_deref(), Some("q.test"));
    }

    #[test]
    fn classification_rules() {
        let original = Relation::default();
        let reply = Relation {
            is_reply: true,
            ..Default::default()
        };

        let kw = Target::keyword("rust");
        assert_eq!(classify(&kw, &original, "x"), ExpansionContext::SearchOriginal);
        assert_eq!(classify(&kw, &reply, "x"), ExpansionContext::SearchNonoriginal);

        let feed = Target::feed("at://feed");
        assert_eq!(classify(&feed, &original, "x"), ExpansionContext::FeedOriginal);
        assert_eq!(classify(&feed, &reply, "x"), ExpansionContext::FeedNonoriginal);

        let author = Target::author("me.test");
        assert_eq!(classify(&author, &original, "me.test"), ExpansionContext::OwnOriginal);
        assert_eq!(classify(&author, &original, "other.test"), ExpansionContext::AuthorFeedOther);
        assert_eq!(classify(&author, &reply, "me.test"), ExpansionContext::AuthorFeedOther);
    }

    #[test]
    fn bare_item_has_permalink_and_no_children() {
        let p = post("did:plc:a", "a.test", "3kabc");
        let item = bare_item(&p, Relation::default(), ExpansionContext::Recursive);
        assert_eq!(
            item.url.as_deref(),
            Some("https://bsky.app/profile/a.test/post/3kabc")
        );
        assert!(item.children.is_none());
        assert_eq!(item.author_id, "did:plc:a");
    }
}
