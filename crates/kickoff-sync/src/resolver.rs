//! Expansion of scheduled events into named channel entries.

use kickoff_core::{
    BroadcasterTable, CatalogEntry, ChannelEntry, Event, CHANNEL_LOGO_URL, DAILY_FEED_NAME,
};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct ChannelResolver {
    table: BroadcasterTable,
}

impl ChannelResolver {
    pub fn new(table: BroadcasterTable) -> Self {
        Self { table }
    }

    /// Output order is the daily-feed entry (when `daily_feed_url` is non-empty), then events in
    /// feed order, broadcasters in event order and catalog entries in catalog order.
    pub fn resolve(
        &self,
        events: &[Event],
        catalog: &[CatalogEntry],
        daily_feed_url: Option<&str>,
    ) -> Vec<ChannelEntry> {
        let mut channels = Vec::new();

        if let Some(url) = daily_feed_url.filter(|url| !url.is_empty()) {
            channels.push(ChannelEntry {
                display_name: DAILY_FEED_NAME.to_string(),
                url: url.to_string(),
                logo_url: CHANNEL_LOGO_URL.to_string(),
            });
        }

        for event in events {
            for broadcaster in &event.broadcasters {
                let Some(kind) = self.table.catalog_type(broadcaster) else {
                    debug!(broadcaster = %broadcaster, "no catalog type for broadcaster");
                    continue;
                };

                let options = catalog
                    .iter()
                    .filter(|entry| entry.kind == kind)
                    .collect::<Vec<_>>();
                let labels = quality_labels(&options);

                for (entry, label) in options.iter().zip(labels) {
                    channels.push(ChannelEntry {
                        display_name: display_name(event, &label, kind),
                        url: entry.url.clone(),
                        logo_url: CHANNEL_LOGO_URL.to_string(),
                    });
                }
            }
        }

        channels
    }
}

/// One label per entry: the bare quality for its first occurrence, `"<quality> <n>"` for the
/// n-th occurrence of the same quality.
pub fn quality_labels(entries: &[&CatalogEntry]) -> Vec<String> {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let ordinal = entries[..index]
                .iter()
                .filter(|earlier| earlier.quality == entry.quality)
                .count()
                + 1;
            if ordinal == 1 {
                entry.quality.clone()
            } else {
                format!("{} {ordinal}", entry.quality)
            }
        })
        .collect()
}

pub fn display_name(event: &Event, quality_label: &str, kind: &str) -> String {
    format!(
        "{} x {} - {} - {} ({})",
        event.team_home,
        event.team_away,
        event.kickoff,
        quality_label,
        kind.to_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: &str, quality: &str, url: &str) -> CatalogEntry {
        CatalogEntry {
            kind: kind.to_string(),
            quality: quality.to_string(),
            url: url.to_string(),
        }
    }

    fn event(broadcasters: &[&str]) -> Event {
        Event {
            team_home: "Gremio".to_string(),
            team_away: "Internacional".to_string(),
            kickoff: "16:00".to_string(),
            broadcasters: broadcasters.iter().map(|b| b.to_string()).collect(),
        }
    }

    fn names(channels: &[ChannelEntry]) -> Vec<&str> {
        channels.iter().map(|c| c.display_name.as_str()).collect()
    }

    fn x_table() -> BroadcasterTable {
        BroadcasterTable::new([("Channel X", "x")])
    }

    #[test]
    fn repeated_qualities_get_positional_suffixes() {
        let catalog = vec![
            entry("x", "FHD", "http://x/1"),
            entry("x", "FHD", "http://x/2"),
            entry("x", "HD", "http://x/3"),
        ];
        let resolver = ChannelResolver::new(x_table());
        let channels = resolver.resolve(&[event(&["Channel X"])], &catalog, None);

        assert_eq!(
            names(&channels),
            vec![
                "Gremio x Internacional - 16:00 - FHD (X)",
                "Gremio x Internacional - 16:00 - FHD 2 (X)",
                "Gremio x Internacional - 16:00 - HD (X)",
            ]
        );
        assert_eq!(channels[1].url, "http://x/2");
        assert!(channels.iter().all(|c| c.logo_url == CHANNEL_LOGO_URL));
    }

    #[test]
    fn ordinals_count_within_the_same_quality_only() {
        let catalog = vec![
            entry("x", "HD", "a"),
            entry("x", "FHD", "b"),
            entry("x", "HD", "c"),
            entry("x", "FHD", "d"),
            entry("x", "HD", "e"),
        ];
        let refs = catalog.iter().collect::<Vec<_>>();
        assert_eq!(
            quality_labels(&refs),
            vec!["HD", "FHD", "HD 2", "FHD 2", "HD 3"]
        );
    }

    #[test]
    fn unknown_broadcasters_are_skipped() {
        let catalog = vec![entry("espn", "HD", "http://espn")];
        let resolver = ChannelResolver::default();
        let channels = resolver.resolve(&[event(&["Premiere"])], &catalog, None);
        assert!(channels.is_empty());
    }

    #[test]
    fn mapped_type_without_catalog_entries_contributes_nothing() {
        let catalog = vec![entry("espn", "HD", "http://espn")];
        let resolver = ChannelResolver::default();
        let channels = resolver.resolve(&[event(&["RedeTV", "ESPN"])], &catalog, None);
        assert_eq!(
            names(&channels),
            vec!["Gremio x Internacional - 16:00 - HD (ESPN)"]
        );
    }

    #[test]
    fn daily_feed_entry_leads_only_when_configured() {
        let catalog = vec![entry("espn", "HD", "http://espn")];
        let events = vec![event(&["ESPN"]), event(&["ESPN"])];
        let resolver = ChannelResolver::default();

        let without = resolver.resolve(&events, &catalog, Some(""));
        assert_eq!(without.len(), 2);
        assert!(without.iter().all(|c| c.display_name != DAILY_FEED_NAME));
        assert_eq!(resolver.resolve(&events, &catalog, None), without);

        let with = resolver.resolve(&events, &catalog, Some("http://feed/today.m3u8"));
        assert_eq!(with.len(), 3);
        assert_eq!(with[0].display_name, DAILY_FEED_NAME);
        assert_eq!(with[0].url, "http://feed/today.m3u8");
        assert_eq!(
            with.iter()
                .filter(|c| c.display_name == DAILY_FEED_NAME)
                .count(),
            1
        );
    }

    #[test]
    fn empty_inputs_yield_at_most_the_daily_feed_entry() {
        let resolver = ChannelResolver::default();
        assert!(resolver.resolve(&[], &[], None).is_empty());
        let only_feed = resolver.resolve(&[], &[], Some("http://feed"));
        assert_eq!(names(&only_feed), vec![DAILY_FEED_NAME]);
    }

    #[test]
    fn events_and_broadcasters_keep_feed_order() {
        let catalog = vec![
            entry("disney", "HD", "http://disney"),
            entry("espn", "FHD", "http://espn"),
        ];
        let mut second = event(&["ESPN"]);
        second.team_home = "Santos".to_string();
        second.team_away = "Sport".to_string();
        let events = vec![event(&["ESPN", "Disney+"]), second];

        let channels = ChannelResolver::default().resolve(&events, &catalog, None);
        assert_eq!(
            names(&channels),
            vec![
                "Gremio x Internacional - 16:00 - FHD (ESPN)",
                "Gremio x Internacional - 16:00 - HD (DISNEY)",
                "Santos x Sport - 16:00 - FHD (ESPN)",
            ]
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let catalog = vec![
            entry("espn", "FHD", "a"),
            entry("espn", "FHD", "b"),
            entry("cazetv", "HD", "c"),
        ];
        let events = vec![event(&["ESPN", "CazéTV", "Unknown"])];
        let resolver = ChannelResolver::default();
        let first = resolver.resolve(&events, &catalog, Some("http://feed"));
        let second = resolver.resolve(&events, &catalog, Some("http://feed"));
        assert_eq!(first, second);
    }
}
