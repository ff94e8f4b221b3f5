// Cookie- and offset-driven search loops built on the plain search
// entry point: simple paged results (RFC 2696) and virtual list view.

use crate::connection::LdapConnection;
use crate::controls::{
    find_control, sort_control, PagedResultsControl, SortKey, VlvRequestControl,
    VlvResponseControl, OID_PAGED_RESULTS, OID_VLV_RESPONSE,
};
use crate::error::{LdapError, Result};
use crate::protocol::{Control, LdapResult, ProtocolOp, SearchRequest, SearchResultEntry};
use tracing::debug;

/// One page of a paged search.
#[derive(Debug)]
pub struct Page {
    pub entries: Vec<SearchResultEntry>,
    /// Continuation references interleaved with the entries.
    pub references: Vec<Vec<String>>,
    pub result: LdapResult,
    /// Server's estimate of the total result set size; 0 when unknown.
    pub size_estimate: i32,
}

/// Paged search driver. Each `next_page` call runs one full search
/// round carrying the cookie from the previous response.
pub struct PagedSearch<'a> {
    conn: &'a LdapConnection,
    request: SearchRequest,
    page_size: i32,
    cookie: Vec<u8>,
    done: bool,
}

impl<'a> PagedSearch<'a> {
    pub fn new(conn: &'a LdapConnection, request: SearchRequest, page_size: i32) -> Self {
        Self {
            conn,
            request,
            page_size,
            cookie: Vec::new(),
            done: false,
        }
    }

    /// Fetch the next page. `Ok(None)` once the server reports there are
    /// no more pages (empty cookie). A page may hold zero entries while
    /// the cookie is still non-empty; the loop keeps going.
    pub async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.done {
            return Ok(None);
        }
        let control =
            PagedResultsControl::new(self.page_size, self.cookie.clone()).to_control(true);
        let (entries, references, result) =
            run_search(self.conn, self.request.clone(), vec![control]).await?;
        let result = result.success()?;

        let (size_estimate, cookie) = match find_control(&result.controls, OID_PAGED_RESULTS) {
            Some(ctrl) => {
                let parsed = PagedResultsControl::parse(ctrl)?;
                (parsed.size, parsed.cookie)
            }
            // Server did not cooperate with paging; treat the whole
            // result as the only page.
            None => {
                debug!("no paged results control in response, assuming single page");
                (0, Vec::new())
            }
        };

        if cookie.is_empty() {
            self.done = true;
        }
        self.cookie = cookie;
        Ok(Some(Page {
            entries,
            references,
            result,
            size_estimate,
        }))
    }

    /// Run the remaining pages to completion and collect every entry.
    pub async fn collect_all(&mut self) -> Result<Vec<SearchResultEntry>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page.entries);
        }
        Ok(all)
    }
}

/// One window of a virtual-list-view search.
#[derive(Debug)]
pub struct VlvWindow {
    pub entries: Vec<SearchResultEntry>,
    /// Index (1-based) the server actually positioned the window at.
    pub target_position: i32,
    /// Server's current count of the whole sorted list.
    pub content_count: i32,
    pub result: LdapResult,
}

/// Virtual list view driver. Requires server-side sorting; the sort
/// keys define the list order the offsets index into.
///
/// Offsets past the current content count are clamped by the server and
/// come back as a short or empty window with the count unchanged.
pub struct VlvSearch<'a> {
    conn: &'a LdapConnection,
    request: SearchRequest,
    sort_keys: Vec<SortKey>,
    before_count: i32,
    after_count: i32,
    /// Count fed back to the server after the first round.
    content_count: i32,
    context_id: Option<Vec<u8>>,
    first_round_done: bool,
}

impl<'a> VlvSearch<'a> {
    pub fn new(
        conn: &'a LdapConnection,
        request: SearchRequest,
        sort_keys: Vec<SortKey>,
        before_count: i32,
        after_count: i32,
    ) -> Self {
        Self {
            conn,
            request,
            sort_keys,
            before_count,
            after_count,
            content_count: 0,
            context_id: None,
            first_round_done: false,
        }
    }

    /// Fetch the window around `offset` (1-based within the sorted list).
    pub async fn window_at(&mut self, offset: i32) -> Result<VlvWindow> {
        let vlv = VlvRequestControl {
            before_count: self.before_count,
            after_count: self.after_count,
            offset,
            content_count: self.content_count,
            context_id: self.context_id.clone(),
        };
        let controls = vec![
            sort_control(&self.sort_keys, true),
            vlv.to_control(true),
        ];
        let (entries, _references, result) =
            run_search(self.conn, self.request.clone(), controls).await?;
        let result = result.success()?;

        let vlv_resp = match find_control(&result.controls, OID_VLV_RESPONSE) {
            Some(ctrl) => VlvResponseControl::parse(ctrl)?,
            None => {
                return Err(LdapError::ProtocolDecode(
                    "server returned no VLV response control".into(),
                ))
            }
        };

        if vlv_resp.result_code != 0 {
            // A failed round after we handed back a context id means the
            // server no longer recognizes our view of the list.
            if self.first_round_done && self.context_id.is_some() {
                return Err(LdapError::VlvContextLost);
            }
            return Err(LdapError::ServerError {
                rc: vlv_resp.result_code,
                matched: String::new(),
                text: "virtual list view request rejected".to_string(),
            });
        }

        // Even on a nominally successful round, a changed or dropped
        // context id means the server restarted its view of the list.
        // Surface that instead of silently repositioning from scratch.
        if self.first_round_done
            && self.context_id.is_some()
            && vlv_resp.context_id != self.context_id
        {
            return Err(LdapError::VlvContextLost);
        }

        self.content_count = vlv_resp.content_count;
        self.context_id = vlv_resp.context_id.clone();
        self.first_round_done = true;
        Ok(VlvWindow {
            entries,
            target_position: vlv_resp.target_position,
            content_count: vlv_resp.content_count,
            result,
        })
    }
}

/// Run one search round to completion, collecting entries and references
/// and returning the final result with its response controls attached.
async fn run_search(
    conn: &LdapConnection,
    request: SearchRequest,
    controls: Vec<Control>,
) -> Result<(Vec<SearchResultEntry>, Vec<Vec<String>>, LdapResult)> {
    let mut handle = conn.search_request(request, Some(controls)).await?;
    let mut entries = Vec::new();
    let mut references = Vec::new();
    loop {
        match handle.next().await? {
            Some(msg) => {
                if matches!(msg.protocol_op, ProtocolOp::SearchResultDone(_)) {
                    let result =
                        crate::operation::terminal_result(&msg).unwrap_or_default();
                    return Ok((entries, references, result));
                }
                match msg.protocol_op {
                    ProtocolOp::SearchResultEntry(entry) => entries.push(entry),
                    ProtocolOp::SearchResultReference(uris) => references.push(uris),
                    other => {
                        return Err(LdapError::ProtocolDecode(format!(
                            "unexpected op 0x{:02X} in search stream",
                            other.tag()
                        )))
                    }
                }
            }
            None => return Err(LdapError::ConnectionClosed),
        }
    }
}
