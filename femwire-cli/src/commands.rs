//! Command execution.

use crate::Commands;
use colored::Colorize;
use femwire_client::Session;
use femwire_protocol::message::{DataInfo, ObjectKind, ScalarValue};
use femwire_protocol::Array;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Executes a command and returns the formatted output.
pub fn execute(session: &Session, cmd: Commands) -> CliResult<String> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Ping => {
            session.ping()?;
            Ok("PONG".green().to_string())
        }

        Commands::Run { command } => run(session, &command),

        Commands::Param { name } => param(session, &name),

        Commands::Info { name } => Ok(format_info(&session.data_info(&name)?)),

        Commands::Show { name } => show(session, &name),

        Commands::Status => Ok(session.run("*STATUS")?),

        Commands::Mesh => mesh(session),

        Commands::Files => files(session),

        Commands::Upload { path } => {
            let filename = session.upload_file(&path)?;
            Ok(format!("{} {}", "Uploaded".green(), filename.cyan()))
        }

        Commands::Download { filename, dest } => {
            let target = session.download_file(&filename, &dest)?;
            Ok(format!(
                "{} {} to {}",
                "Downloaded".green(),
                filename.cyan(),
                target.display()
            ))
        }
    }
}

pub fn run(session: &Session, command: &str) -> CliResult<String> {
    let output = session.run(command)?;
    if output.is_empty() {
        Ok("OK".green().to_string())
    } else {
        Ok(output)
    }
}

pub fn param(session: &Session, name: &str) -> CliResult<String> {
    Ok(match session.parameter(name)? {
        Some(ScalarValue::Number(v)) => format!("{} = {}", name.to_uppercase().cyan(), v),
        Some(ScalarValue::Text(s)) => format!("{} = '{}'", name.to_uppercase().cyan(), s),
        None => format!("{} is not defined", name.to_uppercase()).yellow().to_string(),
    })
}

pub fn format_info(info: &DataInfo) -> String {
    let kind = match info.objtype {
        ObjectKind::Vec => "vector",
        ObjectKind::Dmat => "dense matrix",
        ObjectKind::Smat => "sparse matrix",
        ObjectKind::Solver => "solver",
    };
    let mut out = format!(
        "{}\n  Kind: {}\n  Type: {}\n  Size: {} x {}",
        info.name.cyan().bold(),
        kind,
        info.stype,
        info.size1,
        info.size2
    );
    if let Some(mattype) = info.mattype {
        out.push_str(&format!("\n  Mattype: {}", mattype));
    }
    out
}

pub fn show(session: &Session, name: &str) -> CliResult<String> {
    let info = session.data_info(name)?;
    let (data, rows, cols) = match info.objtype {
        ObjectKind::Vec => (session.vec_data(name, None)?, info.size1 as usize, 1),
        ObjectKind::Dmat | ObjectKind::Smat => (
            session.mat_data(name)?,
            info.size1 as usize,
            info.size2 as usize,
        ),
        ObjectKind::Solver => {
            return Ok(format!("{} is a solver and holds no data", name).yellow().to_string())
        }
    };
    Ok(format!("{}\n{}", format_info(&info), format_values(&data, rows, cols)))
}

/// Renders column-major values one matrix row per line.
fn format_values(data: &Array, rows: usize, cols: usize) -> String {
    let Some(values) = data.to_f64() else {
        return format!("  <{} {} values>", data.len(), data.value_type());
    };
    let mut out = String::new();
    for i in 0..rows {
        let row: Vec<String> = (0..cols)
            .filter_map(|j| values.get(j * rows + i))
            .map(|v| format!("{:>12.5e}", v))
            .collect();
        out.push_str("  ");
        out.push_str(&row.join(" "));
        out.push('\n');
    }
    out
}

pub fn mesh(session: &Session) -> CliResult<String> {
    let mesh = session.mesh();
    let mut out = format!(
        "{}\n  Nodes: {}\n  Elements: {}\n",
        "Mesh".bold(),
        mesh.n_node()?,
        mesh.n_elem()?
    );
    for et in mesh.element_types()? {
        out.push_str(&format!(
            "  ET {} -> {}\n",
            et.number.to_string().cyan(),
            et.routine
        ));
    }
    Ok(out)
}

pub fn files(session: &Session) -> CliResult<String> {
    let files = session.list_files()?;
    if files.is_empty() {
        return Ok("No files".yellow().to_string());
    }
    Ok(files
        .iter()
        .map(|f| format!("  {}", f))
        .collect::<Vec<_>>()
        .join("\n"))
}
