//! Command table and the dispatch pipeline.
//!
//! Every verb is registered once with its minimum permission level and the
//! shape of its arguments. [`parse_command`] applies the same steps to every
//! line, in order: tokenize, look up the verb, check the caller's level,
//! check argument count and shape. Only a line that passes all of them
//! becomes a [`Command`]; handlers never see unchecked input.

use custodia_shared::error::ParseError;
use custodia_shared::protocol::{is_sha256_hex, tokenize, validate_file_name};
use custodia_shared::types::{Decision, PermissionLevel, RequestId};

use crate::error::ServerError;

/// Expected form of one positional argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgShape {
    FileName,
    Sha256Hex,
    Level,
    RequestId,
    Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    List,
    Upload,
    Delete,
    Rename,
    Download,
    Verify,
    RequestPermission,
    ViewRequests,
    ResolveRequest,
    ListUsers,
    Help,
    Exit,
}

/// Registration of one verb.
#[derive(Debug)]
pub struct CommandSpec {
    pub verb: &'static str,
    pub kind: CommandKind,
    pub min_level: PermissionLevel,
    pub required: &'static [ArgShape],
    pub optional: &'static [ArgShape],
    pub usage: &'static str,
}

use ArgShape as A;
use PermissionLevel::{Admin, User};

pub const COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        verb: "LISTAR",
        kind: CommandKind::List,
        min_level: User,
        required: &[],
        optional: &[],
        usage: "LISTAR",
    },
    CommandSpec {
        verb: "CREAR",
        kind: CommandKind::Upload,
        min_level: User,
        required: &[A::FileName],
        optional: &[A::Sha256Hex],
        usage: "CREAR <nombre> [sha256]",
    },
    CommandSpec {
        verb: "SUBIR",
        kind: CommandKind::Upload,
        min_level: User,
        required: &[A::FileName],
        optional: &[A::Sha256Hex],
        usage: "SUBIR <nombre> [sha256]",
    },
    CommandSpec {
        verb: "ELIMINAR",
        kind: CommandKind::Delete,
        min_level: User,
        required: &[A::FileName],
        optional: &[],
        usage: "ELIMINAR <nombre>",
    },
    CommandSpec {
        verb: "RENOMBRAR",
        kind: CommandKind::Rename,
        min_level: User,
        required: &[A::FileName, A::FileName],
        optional: &[],
        usage: "RENOMBRAR <origen> <destino>",
    },
    CommandSpec {
        verb: "DESCARGAR",
        kind: CommandKind::Download,
        min_level: User,
        required: &[A::FileName],
        optional: &[],
        usage: "DESCARGAR <nombre>",
    },
    CommandSpec {
        verb: "VERIFICAR",
        kind: CommandKind::Verify,
        min_level: User,
        required: &[A::FileName],
        optional: &[],
        usage: "VERIFICAR <nombre>",
    },
    CommandSpec {
        verb: "SOLICITAR_PERMISOS",
        kind: CommandKind::RequestPermission,
        min_level: User,
        required: &[A::Level],
        optional: &[],
        usage: "SOLICITAR_PERMISOS <user|admin>",
    },
    CommandSpec {
        verb: "VER_SOLICITUDES",
        kind: CommandKind::ViewRequests,
        min_level: User,
        required: &[],
        optional: &[],
        usage: "VER_SOLICITUDES",
    },
    CommandSpec {
        verb: "APROBAR_PERMISOS",
        kind: CommandKind::ResolveRequest,
        min_level: Admin,
        required: &[A::RequestId, A::Decision],
        optional: &[],
        usage: "APROBAR_PERMISOS <id> <aprobar|rechazar>",
    },
    CommandSpec {
        verb: "LISTAR_USUARIOS",
        kind: CommandKind::ListUsers,
        min_level: Admin,
        required: &[],
        optional: &[],
        usage: "LISTAR_USUARIOS",
    },
    CommandSpec {
        verb: "AYUDA",
        kind: CommandKind::Help,
        min_level: User,
        required: &[],
        optional: &[],
        usage: "AYUDA",
    },
    CommandSpec {
        verb: "SALIR",
        kind: CommandKind::Exit,
        min_level: User,
        required: &[],
        optional: &[],
        usage: "SALIR",
    },
];

/// A fully checked command, ready for its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Upload {
        name: String,
        expected_hash: Option<String>,
    },
    Delete {
        name: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Download {
        name: String,
    },
    Verify {
        name: String,
    },
    RequestPermission {
        level: PermissionLevel,
    },
    ViewRequests,
    ResolveRequest {
        id: RequestId,
        decision: Decision,
    },
    ListUsers,
    Help,
    Exit,
}

/// Case-insensitive verb lookup.
pub fn lookup(verb: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|spec| spec.verb.eq_ignore_ascii_case(verb))
}

/// One argument after its shape check.
enum Arg {
    Name(String),
    Hash(String),
    Level(PermissionLevel),
    Id(RequestId),
    Decision(Decision),
}

/// Run the dispatch pipeline for one command line.
pub fn parse_command(line: &str, level: PermissionLevel) -> Result<Command, ServerError> {
    let mut tokens = tokenize(line)?.into_iter();
    let verb = tokens.next().unwrap_or_default();

    let spec = lookup(&verb).ok_or_else(|| {
        ServerError::protocol(format!(
            "Comando desconocido: {verb}. Escriba AYUDA para ver los comandos"
        ))
    })?;

    if !level.satisfies(spec.min_level) {
        return Err(ServerError::Permission {
            verb: spec.verb.to_string(),
            required: spec.min_level,
        });
    }

    let raw: Vec<String> = tokens.collect();
    let max = spec.required.len() + spec.optional.len();
    if raw.len() < spec.required.len() || raw.len() > max {
        return Err(usage(spec));
    }

    let args = spec
        .required
        .iter()
        .chain(spec.optional)
        .zip(raw)
        .map(|(shape, value)| check_arg(spec, *shape, value))
        .collect::<Result<Vec<_>, _>>()?;

    build(spec, args)
}

fn check_arg(spec: &CommandSpec, shape: ArgShape, value: String) -> Result<Arg, ServerError> {
    let bad = |detail: String| ServerError::protocol(format!("{detail}. Uso: {}", spec.usage));

    match shape {
        ArgShape::FileName => match validate_file_name(&value) {
            Ok(()) => Ok(Arg::Name(value)),
            Err(e) => Err(bad(e.to_string())),
        },
        ArgShape::Sha256Hex if is_sha256_hex(&value) => Ok(Arg::Hash(value.to_ascii_lowercase())),
        ArgShape::Sha256Hex => Err(bad(format!("Hash SHA-256 no válido: {value}"))),
        ArgShape::Level => value
            .parse()
            .map(Arg::Level)
            .map_err(|e: ParseError| bad(e.to_string())),
        ArgShape::RequestId => value
            .parse()
            .map(Arg::Id)
            .map_err(|e: ParseError| bad(e.to_string())),
        ArgShape::Decision => value
            .parse()
            .map(Arg::Decision)
            .map_err(|e: ParseError| bad(e.to_string())),
    }
}

fn build(spec: &CommandSpec, args: Vec<Arg>) -> Result<Command, ServerError> {
    let mut args = args.into_iter();
    let command = match (spec.kind, args.next(), args.next()) {
        (CommandKind::List, None, None) => Command::List,
        (CommandKind::Upload, Some(Arg::Name(name)), hash) => Command::Upload {
            name,
            expected_hash: match hash {
                Some(Arg::Hash(h)) => Some(h),
                None => None,
                Some(_) => return Err(usage(spec)),
            },
        },
        (CommandKind::Delete, Some(Arg::Name(name)), None) => Command::Delete { name },
        (CommandKind::Rename, Some(Arg::Name(from)), Some(Arg::Name(to))) => {
            Command::Rename { from, to }
        }
        (CommandKind::Download, Some(Arg::Name(name)), None) => Command::Download { name },
        (CommandKind::Verify, Some(Arg::Name(name)), None) => Command::Verify { name },
        (CommandKind::RequestPermission, Some(Arg::Level(level)), None) => {
            Command::RequestPermission { level }
        }
        (CommandKind::ViewRequests, None, None) => Command::ViewRequests,
        (CommandKind::ResolveRequest, Some(Arg::Id(id)), Some(Arg::Decision(decision))) => {
            Command::ResolveRequest { id, decision }
        }
        (CommandKind::ListUsers, None, None) => Command::ListUsers,
        (CommandKind::Help, None, None) => Command::Help,
        (CommandKind::Exit, None, None) => Command::Exit,
        _ => return Err(usage(spec)),
    };
    Ok(command)
}

fn usage(spec: &CommandSpec) -> ServerError {
    ServerError::protocol(format!("Uso: {}", spec.usage))
}

/// Single-line summary of the verbs available at `level`.
pub fn help_text(level: PermissionLevel) -> String {
    let usages: Vec<&str> = COMMANDS
        .iter()
        .filter(|spec| level.satisfies(spec.min_level))
        .map(|spec| spec.usage)
        .collect();
    format!("Comandos disponibles: {}", usages.join(" | "))
}
