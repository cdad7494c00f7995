#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "plate",
    action: "stage_plate",
}];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "attach",
    action: "stage_image",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "send",
        action: "submit_image",
    },
    CommandSpec {
        command: "report",
        action: "submit_plate",
    },
    CommandSpec {
        command: "feed",
        action: "show_feed",
    },
    CommandSpec {
        command: "status",
        action: "show_status",
    },
    CommandSpec {
        command: "discard",
        action: "discard_image",
    },
    CommandSpec {
        command: "connect",
        action: "connect",
    },
    CommandSpec {
        command: "disconnect",
        action: "disconnect",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
];

pub const CONSOLE_HELP_COMMANDS: &[&str] = &[
    "/attach",
    "/plate",
    "/send",
    "/report",
    "/feed",
    "/status",
    "/discard",
    "/connect",
    "/disconnect",
    "/help",
    "/quit",
];
