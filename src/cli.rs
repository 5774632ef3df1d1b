use clap::{Args, Parser, Subcommand};

use ntfs_artifact_forge::shadow::ParserType;

const ASCII_LOGO: &str = r#"
  _   _ _____ _____ ____       _         _   _  __            _     _____
 | \ | |_   _|  ___/ ___|     / \   _ __| |_(_)/ _| __ _  ___| |_  |  ___|__  _ __ __ _  ___
 |  \| | | | | |_  \___ \    / _ \ | '__| __| | |_ / _` |/ __| __| | |_ / _ \| '__/ _` |/ _ \
 | |\  | | | |  _|  ___) |  / ___ \| |  | |_| |  _| (_| | (__| |_  |  _| (_) | | | (_| |  __/
 |_| \_| |_| |_|   |____/  /_/   \_\_|   \__|_|_|  \__,_|\___|\__| |_|  \___/|_|  \__, |\___|
                                                                                  |___/
"#;

const EXAMPLES: &str = r#"
ПРИМЕРЫ ИСПОЛЬЗОВАНИЯ:

  1. РАСПОЛОЖЕНИЯ (Locations)
     Перечислить диски, разделы и смонтированные тома этой машины:
     ntfs-artifact-forge locations

     Или просканировать образы дисков и сохранить результат в JSONL:
     ntfs-artifact-forge locations -i disk.raw -o locations.jsonl -p partitions.jsonl

  2. ТЕНЕВЫЕ КОПИИ (Shadows)
     Перечислить теневые копии тома, читая хранилище VSS прямо с диска:
     ntfs-artifact-forge shadows -i disk.raw -v Image_disk_Partition_2 --shadow-parser internal

  3. MFT
     Выгрузить все записи MFT работающего тома C: в JSONL:
     ntfs-artifact-forge mft -v Volume_C -o mft.jsonl

     Выгрузить MFT в том виде, в каком он был в самой новой теневой копии:
     ntfs-artifact-forge mft -i disk.raw -v Image_disk_Partition_2 -s 0 -o mft_vss0.jsonl

Диагностика парсеров: RUST_LOG=debug
"#;

#[derive(Parser, Debug)]
#[command(name = "ntfs-artifact-forge")]
#[command(version)]
#[command(before_help = ASCII_LOGO)] // Логотип НАД меню
#[command(about = "DFIR tool for NTFS volumes, MFT records and volume shadow copies")]
#[command(after_help = EXAMPLES)]    // Примеры ПОД меню
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Выбор парсера теневых копий. Пустое значение - выбор остается за программой.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserSetting(pub Option<ParserType>);

fn parse_parser_setting(value: &str) -> Result<ParserSetting, String> {
    ParserType::parse_setting(value)
        .map(ParserSetting)
        .map_err(|e| e.to_string())
}

#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Образ диска или тома (raw) вместо подключенных устройств (можно несколько)
    #[arg(short, long = "image")]
    pub images: Vec<String>,
    /// Идентификатор тома, как его печатает `locations`; по умолчанию первый том NTFS
    #[arg(short, long)]
    pub volume: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Перечисляет диски, разделы, смонтированные тома и образы
    Locations {
        /// Образ диска или тома (raw) вместо подключенных устройств (можно несколько)
        #[arg(short, long = "image")]
        images: Vec<String>,
        /// JSONL с расположениями (1 строка - 1 расположение)
        #[arg(short, long)]
        out: Option<String>,
        /// JSONL с записями таблиц разделов
        #[arg(short, long)]
        partitions: Option<String>,
    },
    /// Перечисляет теневые копии тома
    Shadows {
        #[command(flatten)]
        source: SourceArgs,
        /// Парсер теневых копий: unknown, microsoft или internal
        #[arg(long, value_parser = parse_parser_setting, default_value = "")]
        shadow_parser: ParserSetting,
        /// Путь к итоговому JSONL; без него вывод в stdout
        #[arg(short, long)]
        out: Option<String>,
    },
    /// Выгружает записи MFT тома или его теневой копии в JSONL
    Mft {
        #[command(flatten)]
        source: SourceArgs,
        /// Читать из теневой копии с этим индексом в цепочке (0 - самая новая)
        #[arg(short, long)]
        shadow: Option<usize>,
        /// Парсер теневых копий: unknown, microsoft или internal
        #[arg(long, value_parser = parse_parser_setting, default_value = "")]
        shadow_parser: ParserSetting,
        /// Путь к итоговому JSONL; без него вывод в stdout
        #[arg(short, long)]
        out: Option<String>,
    },
}
