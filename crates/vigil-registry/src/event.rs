//! Event ledger queries
//!
//! Events are keyed by time-ordered tokens, so a column scan of the account's
//! row yields them in time order.

use vigil_common::Token;
use vigil_persistence::ColumnRange;

use crate::context::AccountContext;
use crate::error::{RegistryError, Result};
use crate::model::{Event, EventType, Page, Pagination, schema};
use crate::registry::Registry;

/// Filter for [`Registry::list_events`]
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Start at this token, inclusive; ignored when paginating with a marker
    pub from: Option<Token>,
    pub event_type: Option<EventType>,
    pub pagination: Pagination,
}

impl EventQuery {
    pub fn starting_at(mut self, token: Token) -> Self {
        self.from = Some(token);
        self
    }

    pub fn of_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }
}

impl Registry {
    pub async fn get_event(&self, ctx: &AccountContext, id: &str) -> Result<Event> {
        match self.store.get(schema::EVENTS, ctx.account_id(), id).await? {
            Some(cell) => Ok(cell.decode()?),
            None => Err(RegistryError::not_found("event", id)),
        }
    }

    /// Events up to now in time order, after rectifying the account
    pub async fn list_events(&self, ctx: &AccountContext, query: &EventQuery) -> Result<Page<Event>> {
        self.rectify_inline(ctx).await?;
        let account_id = ctx.account_id();
        let limit = query.pagination.limit;
        let end = Token::high(self.clock.now_millis()).to_string();

        let mut range = match (&query.pagination.marker, query.from) {
            (Some(marker), _) => {
                ColumnRange::inclusive(marker.clone(), end.clone()).start_after(marker.clone())
            }
            (None, Some(from)) => ColumnRange::inclusive(from.to_string(), end.clone()),
            (None, None) => {
                ColumnRange::inclusive(Token::low(ctx.account.created_at).to_string(), end.clone())
            }
        };

        // Keep scanning until the type filter leaves enough events to fill the page
        let mut events = Vec::with_capacity(limit + 1);
        while events.len() <= limit && !range.is_empty() {
            let cells = self
                .store
                .slice(schema::EVENTS, account_id, &range, limit + 1)
                .await?;
            for cell in &cells {
                let event: Event = cell.decode()?;
                if query.event_type.is_none_or(|t| t == event.event_type) {
                    events.push(event);
                }
            }
            match cells.last() {
                Some(last) if cells.len() == limit + 1 => {
                    range = ColumnRange::inclusive(last.column.clone(), end.clone())
                        .start_after(last.column.clone());
                }
                _ => break,
            }
        }
        Ok(Page::from_overfetch(events, &query.pagination, |e| e.id.to_string()))
    }
}
