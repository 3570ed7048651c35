//! View message kinds and their handling buckets.
//!
//! Every `view-message` names a kind in `message.type`. Each known kind
//! belongs to exactly one of three closed enums:
//!
//! - [`ForwardedKind`]: passed to a backend (assistant, bus, terminals)
//! - [`LocalKind`]: answered from router state
//! - [`UnsupportedKind`]: desktop-shell features with no backend here,
//!   answered with a typed `unsupported` error
//!
//! Anything else is an `invalid-request`.

// Rust guideline compliant 2026-02

use std::fmt;

/// Kinds passed through to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardedKind {
    /// Correlated request to the assistant.
    AssistantRequest,
    /// Notification to the assistant.
    AssistantNotification,
    /// Answer to an assistant-initiated request.
    AssistantResponse,
    /// Restart the assistant process.
    AssistantRestart,
    /// Cancellable assistant request.
    Fetch,
    /// Cancel a pending fetch.
    CancelFetch,
    /// Correlated bus request.
    BusRequest,
    /// Bus broadcast.
    BusBroadcast,
    /// Create (or attach to) a terminal session.
    TerminalCreate,
    /// Attach to an existing terminal session.
    TerminalAttach,
    /// Terminal input.
    TerminalWrite,
    /// Terminal window size.
    TerminalResize,
    /// Kill a terminal session.
    TerminalClose,
    /// Stop listening to a terminal session.
    TerminalDetach,
}

impl ForwardedKind {
    /// Every forwarded kind.
    pub const ALL: [Self; 14] = [
        Self::AssistantRequest,
        Self::AssistantNotification,
        Self::AssistantResponse,
        Self::AssistantRestart,
        Self::Fetch,
        Self::CancelFetch,
        Self::BusRequest,
        Self::BusBroadcast,
        Self::TerminalCreate,
        Self::TerminalAttach,
        Self::TerminalWrite,
        Self::TerminalResize,
        Self::TerminalClose,
        Self::TerminalDetach,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AssistantRequest => "assistant-request",
            Self::AssistantNotification => "assistant-notification",
            Self::AssistantResponse => "assistant-response",
            Self::AssistantRestart => "assistant-restart",
            Self::Fetch => "fetch",
            Self::CancelFetch => "cancel-fetch",
            Self::BusRequest => "bus-request",
            Self::BusBroadcast => "bus-broadcast",
            Self::TerminalCreate => "terminal-create",
            Self::TerminalAttach => "terminal-attach",
            Self::TerminalWrite => "terminal-write",
            Self::TerminalResize => "terminal-resize",
            Self::TerminalClose => "terminal-close",
            Self::TerminalDetach => "terminal-detach",
        }
    }
}

/// Kinds answered from router state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKind {
    /// Liveness check.
    Ping,
    /// Assistant and bus connection state.
    AssistantStatus,
    /// Read workspace roots.
    WorkspaceRootsGet,
    /// Replace workspace roots.
    WorkspaceRootsSet,
    /// Add one workspace root.
    WorkspaceRootAdd,
    /// Remove one workspace root.
    WorkspaceRootRemove,
    /// Subscribe to a shared object.
    SharedObjectSubscribe,
    /// Unsubscribe from a shared object.
    SharedObjectUnsubscribe,
    /// Update a shared object.
    SharedObjectSet,
    /// Read every persisted atom.
    PersistedAtomSync,
    /// Write one persisted atom.
    PersistedAtomUpdate,
    /// Remove one persisted atom.
    PersistedAtomReset,
    /// List terminal sessions.
    TerminalList,
}

impl LocalKind {
    /// Every local kind.
    pub const ALL: [Self; 13] = [
        Self::Ping,
        Self::AssistantStatus,
        Self::WorkspaceRootsGet,
        Self::WorkspaceRootsSet,
        Self::WorkspaceRootAdd,
        Self::WorkspaceRootRemove,
        Self::SharedObjectSubscribe,
        Self::SharedObjectUnsubscribe,
        Self::SharedObjectSet,
        Self::PersistedAtomSync,
        Self::PersistedAtomUpdate,
        Self::PersistedAtomReset,
        Self::TerminalList,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::AssistantStatus => "assistant-status",
            Self::WorkspaceRootsGet => "workspace-roots-get",
            Self::WorkspaceRootsSet => "workspace-roots-set",
            Self::WorkspaceRootAdd => "workspace-root-add",
            Self::WorkspaceRootRemove => "workspace-root-remove",
            Self::SharedObjectSubscribe => "shared-object-subscribe",
            Self::SharedObjectUnsubscribe => "shared-object-unsubscribe",
            Self::SharedObjectSet => "shared-object-set",
            Self::PersistedAtomSync => "persisted-atom-sync",
            Self::PersistedAtomUpdate => "persisted-atom-update",
            Self::PersistedAtomReset => "persisted-atom-reset",
            Self::TerminalList => "terminal-list",
        }
    }
}

/// Desktop-shell kinds this bridge cannot serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnsupportedKind {
    /// Native context menu.
    ShowContextMenu,
    /// Native file picker.
    ShowOpenDialog,
    /// Window title.
    SetWindowTitle,
    /// Dock/taskbar badge.
    SetBadgeCount,
    /// Auto-updater.
    CheckForUpdates,
    /// Developer tools.
    ToggleDevtools,
    /// OS notification.
    NativeNotification,
}

impl UnsupportedKind {
    /// Every unsupported kind.
    pub const ALL: [Self; 7] = [
        Self::ShowContextMenu,
        Self::ShowOpenDialog,
        Self::SetWindowTitle,
        Self::SetBadgeCount,
        Self::CheckForUpdates,
        Self::ToggleDevtools,
        Self::NativeNotification,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShowContextMenu => "show-context-menu",
            Self::ShowOpenDialog => "show-open-dialog",
            Self::SetWindowTitle => "set-window-title",
            Self::SetBadgeCount => "set-badge-count",
            Self::CheckForUpdates => "check-for-updates",
            Self::ToggleDevtools => "toggle-devtools",
            Self::NativeNotification => "native-notification",
        }
    }
}

/// A classified view message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Forwarded bucket.
    Forwarded(ForwardedKind),
    /// Locally resolved bucket.
    Local(LocalKind),
    /// Gracefully unsupported bucket.
    Unsupported(UnsupportedKind),
}

impl MessageKind {
    /// Classify a wire name. `None` for unknown kinds.
    pub fn parse(name: &str) -> Option<Self> {
        ForwardedKind::ALL
            .into_iter()
            .find(|k| k.as_str() == name)
            .map(Self::Forwarded)
            .or_else(|| {
                LocalKind::ALL
                    .into_iter()
                    .find(|k| k.as_str() == name)
                    .map(Self::Local)
            })
            .or_else(|| {
                UnsupportedKind::ALL
                    .into_iter()
                    .find(|k| k.as_str() == name)
                    .map(Self::Unsupported)
            })
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forwarded(k) => k.as_str(),
            Self::Local(k) => k.as_str(),
            Self::Unsupported(k) => k.as_str(),
        }
    }

    /// Every known kind across all buckets.
    pub fn all() -> impl Iterator<Item = Self> {
        ForwardedKind::ALL
            .into_iter()
            .map(Self::Forwarded)
            .chain(LocalKind::ALL.into_iter().map(Self::Local))
            .chain(UnsupportedKind::ALL.into_iter().map(Self::Unsupported))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
